//! Batched, parallel top-K distance queries (`TVS.GETDISTANCE`).
//!
//! The server can compute the distance between a query vector and an
//! explicit list of keys. For large key sets the aggregator:
//!
//! 1. encodes the query vector once;
//! 2. cuts the keys into contiguous batches of `batch_size`;
//! 3. sends one `TVS.GETDISTANCE ... TOPN k` per batch, at most
//!    `parallelism` at a time, each task writing into its own slot;
//! 4. k-way merges the per-batch replies (each already ascending by
//!    distance) and keeps the first `k = min(|keys|, top_n)` entries.
//!
//! ```text
//! keys ──chunks──► [b0] [b1] [b2] ... [bn]
//!                   │    │    │         │      ≤ parallelism in flight
//!                   ▼    ▼    ▼         ▼
//!                 slot0 slot1 slot2 ... slotn  (each sorted by distance)
//!                   └────┴─────┴───┬─────┘
//!                                  ▼
//!                       heap merge, first k entries
//! ```
//!
//! Any failed batch fails the whole call: the remaining tasks are aborted
//! and no partial result is returned. Dropping the returned future also
//! aborts every in-flight batch.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::debug;

use super::VectorError;
use super::codec::{CodecError, EncodedVector, Vector};
use crate::transport::{Command, Reply, Transport};

pub const GETDISTANCE_CMD: &str = "TVS.GETDISTANCE";

pub const DEFAULT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_PARALLELISM: usize = 1;

/// Batching and concurrency settings for [`DistanceAggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistanceConfig {
    /// Keys per `TVS.GETDISTANCE` call.
    pub batch_size: usize,
    /// Maximum batches in flight.
    pub parallelism: usize,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl DistanceConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(val) = dotenvy::var("TVS_GETDISTANCE_BATCH_SIZE")
            && let Ok(n) = val.parse()
        {
            cfg.batch_size = n;
        }

        if let Ok(val) = dotenvy::var("TVS_GETDISTANCE_PARALLELISM")
            && let Ok(n) = val.parse()
        {
            cfg.parallelism = n;
        }

        cfg
    }
}

/// One `(key, distance)` pair from a distance or KNN reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceEntry {
    pub key: String,
    pub distance: f64,
}

impl DistanceEntry {
    pub fn new(key: impl Into<String>, distance: f64) -> Self {
        Self {
            key: key.into(),
            distance,
        }
    }
}

/// A query vector, either as components or already in wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryVector {
    Vector(Vector),
    Encoded(EncodedVector),
}

impl QueryVector {
    pub fn encode(&self) -> Result<EncodedVector, CodecError> {
        match self {
            QueryVector::Vector(v) => v.encode(),
            QueryVector::Encoded(e) => Ok(e.clone()),
        }
    }
}

impl From<Vector> for QueryVector {
    fn from(value: Vector) -> Self {
        QueryVector::Vector(value)
    }
}

impl From<EncodedVector> for QueryVector {
    fn from(value: EncodedVector) -> Self {
        QueryVector::Encoded(value)
    }
}

/// Inputs of one top-K distance computation.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceQuery {
    pub index: String,
    pub vector: QueryVector,
    /// Candidate keys. Duplicates are not removed.
    pub keys: Vec<String>,
    pub top_n: Option<usize>,
    pub max_dist: Option<f64>,
    pub filter: Option<String>,
}

impl DistanceQuery {
    pub fn new(
        index: impl Into<String>,
        vector: impl Into<QueryVector>,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            index: index.into(),
            vector: vector.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            top_n: None,
            max_dist: None,
            filter: None,
        }
    }

    pub fn top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }

    pub fn max_dist(mut self, max_dist: f64) -> Self {
        self.max_dist = Some(max_dist);
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Number of entries the merged result is bounded by.
    pub fn result_bound(&self) -> usize {
        match self.top_n {
            Some(n) => n.min(self.keys.len()),
            None => self.keys.len(),
        }
    }
}

/// Scatter-gather executor for [`DistanceQuery`].
#[derive(Debug, Clone, Default)]
pub struct DistanceAggregator {
    config: DistanceConfig,
}

type BatchOutcome = (usize, Result<Vec<DistanceEntry>, VectorError>);

impl DistanceAggregator {
    pub fn new(config: DistanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DistanceConfig {
        &self.config
    }

    /// Compute the `top_n` closest keys, ascending by distance.
    pub async fn top_k<T>(
        &self,
        transport: &Arc<T>,
        query: &DistanceQuery,
    ) -> Result<Vec<DistanceEntry>, VectorError>
    where
        T: Transport + 'static,
    {
        let DistanceConfig {
            batch_size,
            parallelism,
        } = self.config;
        if query.keys.is_empty() {
            return Err(VectorError::InvalidArgument(
                "candidate key set is empty".to_string(),
            ));
        }
        if parallelism == 0 {
            return Err(VectorError::InvalidArgument(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(VectorError::InvalidArgument(
                "batch_size must be at least 1".to_string(),
            ));
        }

        let k = query.result_bound();
        if k == 0 {
            return Ok(Vec::new());
        }

        let vector = query.vector.encode()?;
        let batch_count = query.keys.len().div_ceil(batch_size);
        let started = Instant::now();
        debug!(
            index = %query.index,
            keys = query.keys.len(),
            batches = batch_count,
            k,
            parallelism,
            "Dispatching distance batches"
        );

        let mut pending = query
            .keys
            .chunks(batch_size)
            .map(|batch| batch_command(query, &vector, batch, k))
            .enumerate();
        let mut slots: Vec<Option<Vec<DistanceEntry>>> = (0..batch_count).map(|_| None).collect();
        let mut tasks: JoinSet<BatchOutcome> = JoinSet::new();

        for (slot, command) in pending.by_ref().take(parallelism) {
            spawn_batch(&mut tasks, Arc::clone(transport), slot, command);
        }

        // Returning early drops `tasks`, which aborts whatever is still running.
        while let Some(joined) = tasks.join_next().await {
            let (slot, outcome) = joined.map_err(|e| VectorError::BatchTask(e.to_string()))?;
            slots[slot] = Some(outcome?);
            if let Some((slot, command)) = pending.next() {
                spawn_batch(&mut tasks, Arc::clone(transport), slot, command);
            }
        }

        let runs: Vec<Vec<DistanceEntry>> = slots.into_iter().map(Option::unwrap_or_default).collect();
        let merged = merge_sorted_runs(runs, k);

        debug!(
            index = %query.index,
            results = merged.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Distance batches merged"
        );
        Ok(merged)
    }
}

fn batch_command(
    query: &DistanceQuery,
    vector: &EncodedVector,
    batch: &[String],
    k: usize,
) -> Command {
    let mut cmd = Command::new(GETDISTANCE_CMD)
        .arg(&query.index)
        .arg(vector)
        .arg(batch.len())
        .args(batch)
        .arg("TOPN")
        .arg(k);
    if let Some(max_dist) = query.max_dist {
        cmd = cmd.arg("MAX_DIST").arg(max_dist);
    }
    if let Some(filter) = &query.filter {
        cmd = cmd.arg("FILTER").arg(filter);
    }
    cmd
}

fn spawn_batch<T>(tasks: &mut JoinSet<BatchOutcome>, transport: Arc<T>, slot: usize, command: Command)
where
    T: Transport + 'static,
{
    tasks.spawn(async move {
        let outcome = match transport.execute(command).await {
            Ok(reply) => parse_distance_pairs(reply),
            Err(e) => Err(VectorError::from(e)),
        };
        (slot, outcome)
    });
}

/// Parse a flat `[key, distance, key, distance, ...]` reply.
pub fn parse_distance_pairs(reply: Reply) -> Result<Vec<DistanceEntry>, VectorError> {
    let items = match reply {
        Reply::Array(items) => items,
        Reply::Nil => return Ok(Vec::new()),
        other => {
            return Err(VectorError::UnexpectedReply(format!(
                "distance reply is {}, expected an array",
                other.kind()
            )));
        }
    };
    if items.len() % 2 != 0 {
        return Err(VectorError::UnexpectedReply(format!(
            "distance reply has odd length {}",
            items.len()
        )));
    }

    let mut entries = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(distance)) = (items.next(), items.next()) {
        let key = key.to_string_lossy().ok_or_else(|| {
            VectorError::UnexpectedReply(format!("distance key is {}", key.kind()))
        })?;
        let distance = parse_distance(&distance)?;
        entries.push(DistanceEntry { key, distance });
    }
    Ok(entries)
}

fn parse_distance(reply: &Reply) -> Result<f64, VectorError> {
    if let Reply::Integer(n) = reply {
        return Ok(*n as f64);
    }
    reply
        .as_bytes()
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .ok_or_else(|| {
            VectorError::UnexpectedReply(format!(
                "cannot parse distance from {:?}",
                reply.to_string_lossy().unwrap_or_else(|| reply.kind().to_string())
            ))
        })
}

/// Head of one sorted run inside the merge heap.
#[derive(Debug)]
struct RunHead {
    entry: DistanceEntry,
    run: usize,
}

impl PartialEq for RunHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunHead {}

impl PartialOrd for RunHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .distance
            .total_cmp(&other.entry.distance)
            .then_with(|| self.run.cmp(&other.run))
    }
}

/// K-way merge of runs that are each ascending by distance, keeping at
/// most `limit` entries. Equal distances come out in run order.
pub fn merge_sorted_runs(runs: Vec<Vec<DistanceEntry>>, limit: usize) -> Vec<DistanceEntry> {
    let total: usize = runs.iter().map(Vec::len).sum();
    let mut runs: Vec<std::vec::IntoIter<DistanceEntry>> =
        runs.into_iter().map(Vec::into_iter).collect();

    let mut heap = BinaryHeap::with_capacity(runs.len());
    for (run, iter) in runs.iter_mut().enumerate() {
        if let Some(entry) = iter.next() {
            heap.push(Reverse(RunHead { entry, run }));
        }
    }

    let mut merged = Vec::with_capacity(limit.min(total));
    while merged.len() < limit {
        let Some(Reverse(head)) = heap.pop() else {
            break;
        };
        if let Some(entry) = runs[head.run].next() {
            heap.push(Reverse(RunHead {
                entry,
                run: head.run,
            }));
        }
        merged.push(head.entry);
    }
    merged
}
