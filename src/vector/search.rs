//! KNN search command family.
//!
//! These map one call to one server command; the server runs the ANN search
//! and returns `[key, distance, ...]` pairs ascending by distance. The
//! multi-vector variants return one such list per query vector.

use super::VectorError;
use super::codec::EncodedVector;
use super::distance::{DistanceEntry, QueryVector, parse_distance_pairs};
use crate::transport::{Command, Reply};

pub const KNNSEARCH_CMD: &str = "TVS.KNNSEARCH";
pub const MKNNSEARCH_CMD: &str = "TVS.MKNNSEARCH";
pub const MINDEXKNNSEARCH_CMD: &str = "TVS.MINDEXKNNSEARCH";
pub const MINDEXMKNNSEARCH_CMD: &str = "TVS.MINDEXMKNNSEARCH";

/// Optional filter expression and extra search parameters (`ef_search` and
/// friends), appended after the vectors in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub filter: Option<String>,
    pub params: Vec<(String, String)>,
}

impl SearchOptions {
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    fn append_to(&self, mut cmd: Command) -> Command {
        if let Some(filter) = &self.filter {
            cmd = cmd.arg(filter);
        }
        for (name, value) in &self.params {
            cmd = cmd.arg(name).arg(value);
        }
        cmd
    }
}

fn encode_all(vectors: &[QueryVector]) -> Result<Vec<EncodedVector>, VectorError> {
    vectors
        .iter()
        .map(|v| v.encode().map_err(VectorError::from))
        .collect()
}

pub fn knn_command(
    index: &str,
    k: usize,
    vector: &QueryVector,
    options: &SearchOptions,
) -> Result<Command, VectorError> {
    let cmd = Command::new(KNNSEARCH_CMD)
        .arg(index)
        .arg(k)
        .arg(vector.encode()?);
    Ok(options.append_to(cmd))
}

pub fn mknn_command(
    index: &str,
    k: usize,
    vectors: &[QueryVector],
    options: &SearchOptions,
) -> Result<Command, VectorError> {
    let encoded = encode_all(vectors)?;
    let cmd = Command::new(MKNNSEARCH_CMD)
        .arg(index)
        .arg(k)
        .arg(encoded.len())
        .args(encoded);
    Ok(options.append_to(cmd))
}

pub fn mindex_knn_command(
    indexes: &[String],
    k: usize,
    vector: &QueryVector,
    options: &SearchOptions,
) -> Result<Command, VectorError> {
    if indexes.is_empty() {
        return Err(VectorError::InvalidArgument("no index given".to_string()));
    }
    let cmd = Command::new(MINDEXKNNSEARCH_CMD)
        .arg(indexes.len())
        .args(indexes)
        .arg(k)
        .arg(vector.encode()?);
    Ok(options.append_to(cmd))
}

pub fn mindex_mknn_command(
    indexes: &[String],
    k: usize,
    vectors: &[QueryVector],
    options: &SearchOptions,
) -> Result<Command, VectorError> {
    if indexes.is_empty() {
        return Err(VectorError::InvalidArgument("no index given".to_string()));
    }
    let encoded = encode_all(vectors)?;
    let cmd = Command::new(MINDEXMKNNSEARCH_CMD)
        .arg(indexes.len())
        .args(indexes)
        .arg(k)
        .arg(encoded.len())
        .args(encoded);
    Ok(options.append_to(cmd))
}

/// Parse one search result per query vector.
pub fn parse_multi_search(reply: Reply) -> Result<Vec<Vec<DistanceEntry>>, VectorError> {
    match reply {
        Reply::Array(results) => results.into_iter().map(parse_distance_pairs).collect(),
        Reply::Nil => Ok(Vec::new()),
        other => Err(VectorError::UnexpectedReply(format!(
            "multi search reply is {}, expected an array",
            other.kind()
        ))),
    }
}
