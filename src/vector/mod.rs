//! Vector index client.
//!
//! - **[`codec`]**: text vector wire format (`[0.500000,1.000000]`, `[1,0,1]`).
//! - **[`scan`]**: lazy cursor scans over `TVS.SCANINDEX` / `TVS.SCAN`.
//! - **[`distance`]**: batched, parallel top-K over `TVS.GETDISTANCE`.
//! - **[`search`]**: the `TVS.*KNNSEARCH` command family.
//!
//! [`VectorClient`] ties them to a [`Transport`]. There is no process-wide
//! client: create one per connection target and pass it around.

pub mod codec;
pub mod distance;
pub mod scan;
pub mod search;

use std::sync::Arc;

use thiserror::Error;

pub use codec::{CodecError, DecodedVector, EncodedVector, Vector};
pub use distance::{
    DistanceAggregator, DistanceConfig, DistanceEntry, DistanceQuery, QueryVector,
};
pub use scan::{ScanCursor, ScanRequest};
pub use search::SearchOptions;

use crate::transport::{Arg, Command, Reply, Transport, TransportError};

pub const SCAN_INDEX_CMD: &str = "TVS.SCANINDEX";
pub const SCAN_CMD: &str = "TVS.SCAN";

/// Page size hint sent with scans when the caller does not pick one.
pub const DEFAULT_SCAN_COUNT: usize = 10;

/// Errors surfaced by vector operations.
#[derive(Debug, Error)]
pub enum VectorError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// A batch task panicked or was cancelled by the runtime.
    #[error("batch task failed: {0}")]
    BatchTask(String),
}

/// Options shared by [`VectorClient::scan_index`], [`VectorClient::scan`]
/// and [`VectorClient::scan_page`].
///
/// `TVS.SCANINDEX` only understands `pattern` and `count`; the filter and
/// vector range apply to `TVS.SCAN`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub pattern: Option<String>,
    pub count: usize,
    pub filter: Option<String>,
    /// Only entries within `max_dist` of this vector; both must be set.
    pub vector: Option<QueryVector>,
    pub max_dist: Option<f64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pattern: None,
            count: DEFAULT_SCAN_COUNT,
            filter: None,
            vector: None,
            max_dist: None,
        }
    }
}

impl ScanOptions {
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    fn has_entry_filters(&self) -> bool {
        self.filter.is_some() || self.vector.is_some() || self.max_dist.is_some()
    }

    fn extra_args(&self) -> Result<Vec<Arg>, VectorError> {
        let mut args = Vec::new();
        if let Some(filter) = &self.filter {
            args.push(Arg::from("FILTER"));
            args.push(Arg::from(filter));
        }
        match (&self.vector, self.max_dist) {
            (Some(vector), Some(max_dist)) => {
                args.push(Arg::from("VECTOR"));
                args.push(Arg::from(vector.encode()?));
                args.push(Arg::from("MAX_DIST"));
                args.push(Arg::from(max_dist));
            }
            (None, None) => {}
            _ => {
                return Err(VectorError::InvalidArgument(
                    "missing vector or max_dist".to_string(),
                ));
            }
        }
        Ok(args)
    }
}

/// Client for the vector commands of one server.
pub struct VectorClient<T: Transport> {
    transport: Arc<T>,
    distance: DistanceAggregator,
}

impl<T: Transport + 'static> VectorClient<T> {
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<T>) -> Self {
        Self {
            transport,
            distance: DistanceAggregator::default(),
        }
    }

    /// Replace the batching/parallelism settings used by [`Self::top_k`].
    pub fn with_distance_config(mut self, config: DistanceConfig) -> Self {
        self.distance = DistanceAggregator::new(config);
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn distance_config(&self) -> &DistanceConfig {
        self.distance.config()
    }

    /// Lazily enumerate index names. Only `pattern` and `count` are used;
    /// setting a filter or vector range is `InvalidArgument`.
    pub fn scan_index(&self, options: &ScanOptions) -> Result<ScanCursor<'_, T>, VectorError> {
        if options.has_entry_filters() {
            return Err(VectorError::InvalidArgument(format!(
                "{SCAN_INDEX_CMD} takes only pattern and count"
            )));
        }
        let request = ScanRequest::new(SCAN_INDEX_CMD)
            .pattern(options.pattern.clone())
            .count(Some(options.count));
        Ok(ScanCursor::new(&*self.transport, request))
    }

    /// Lazily enumerate entry keys of an index.
    pub fn scan(&self, index: &str, options: &ScanOptions) -> Result<ScanCursor<'_, T>, VectorError> {
        Ok(ScanCursor::new(&*self.transport, Self::entry_scan(index, options)?))
    }

    /// Fetch one `TVS.SCAN` page at an explicit cursor, for callers that
    /// keep the cursor themselves. Returns `(next_cursor, items)`; unlike
    /// [`ScanCursor`], an empty page says nothing about termination.
    pub async fn scan_page(
        &self,
        index: &str,
        cursor: &str,
        options: &ScanOptions,
    ) -> Result<(String, Vec<Reply>), VectorError> {
        let cmd = Self::entry_scan(index, options)?.page_command(cursor);
        scan::parse_scan_reply(self.transport.execute(cmd).await?)
    }

    fn entry_scan(index: &str, options: &ScanOptions) -> Result<ScanRequest, VectorError> {
        Ok(ScanRequest::new(SCAN_CMD)
            .target(index)
            .pattern(options.pattern.clone())
            .count(Some(options.count))
            .extra(options.extra_args()?))
    }

    /// Top-K closest keys over batched parallel `TVS.GETDISTANCE` calls.
    pub async fn top_k(&self, query: &DistanceQuery) -> Result<Vec<DistanceEntry>, VectorError> {
        self.distance.top_k(&self.transport, query).await
    }

    /// Single unbatched `TVS.GETDISTANCE` call; no `TOPN` unless `top_n` is set.
    pub async fn get_distance(&self, query: &DistanceQuery) -> Result<Vec<DistanceEntry>, VectorError> {
        let mut cmd = Command::new(distance::GETDISTANCE_CMD)
            .arg(&query.index)
            .arg(query.vector.encode()?)
            .arg(query.keys.len())
            .args(&query.keys);
        if let Some(top_n) = query.top_n {
            cmd = cmd.arg("TOPN").arg(top_n);
        }
        if let Some(max_dist) = query.max_dist {
            cmd = cmd.arg("MAX_DIST").arg(max_dist);
        }
        if let Some(filter) = &query.filter {
            cmd = cmd.arg("FILTER").arg(filter);
        }
        let reply = self.transport.execute(cmd).await?;
        distance::parse_distance_pairs(reply)
    }

    pub async fn knn_search(
        &self,
        index: &str,
        k: usize,
        vector: &QueryVector,
        options: &SearchOptions,
    ) -> Result<Vec<DistanceEntry>, VectorError> {
        let cmd = search::knn_command(index, k, vector, options)?;
        distance::parse_distance_pairs(self.transport.execute(cmd).await?)
    }

    pub async fn mknn_search(
        &self,
        index: &str,
        k: usize,
        vectors: &[QueryVector],
        options: &SearchOptions,
    ) -> Result<Vec<Vec<DistanceEntry>>, VectorError> {
        let cmd = search::mknn_command(index, k, vectors, options)?;
        search::parse_multi_search(self.transport.execute(cmd).await?)
    }

    pub async fn mindex_knn_search(
        &self,
        indexes: &[String],
        k: usize,
        vector: &QueryVector,
        options: &SearchOptions,
    ) -> Result<Vec<DistanceEntry>, VectorError> {
        let cmd = search::mindex_knn_command(indexes, k, vector, options)?;
        distance::parse_distance_pairs(self.transport.execute(cmd).await?)
    }

    pub async fn mindex_mknn_search(
        &self,
        indexes: &[String],
        k: usize,
        vectors: &[QueryVector],
        options: &SearchOptions,
    ) -> Result<Vec<Vec<DistanceEntry>>, VectorError> {
        let cmd = search::mindex_mknn_command(indexes, k, vectors, options)?;
        search::parse_multi_search(self.transport.execute(cmd).await?)
    }
}
