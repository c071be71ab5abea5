//! Cursor-driven lazy scans over paginated server commands.
//!
//! The server enumerates indexes (`TVS.SCANINDEX`) and entries
//! (`TVS.SCAN`) a page at a time: each call takes a cursor and answers
//! `[next_cursor, [items...]]`, with `"0"` meaning there is nothing left.
//! [`ScanCursor`] turns that into a pull-based sequence that fetches one page
//! at a time.
//!
//! Termination follows the long-standing client behaviour: the scan ends
//! when the server returns cursor `"0"` **or** as soon as a fetched page is
//! empty, whatever cursor came with it. A legitimately empty page in the
//! middle of a scan (possible after heavy deletion) therefore ends the scan
//! early. Callers that need an exhaustive walk should keep that in mind.

use tracing::debug;

use super::VectorError;
use crate::transport::{Arg, Command, Reply, Transport};

/// Cursor value that starts a scan and, when returned, ends it.
pub const SENTINEL_CURSOR: &str = "0";

/// Description of one paginated command; the cursor is filled in per page.
///
/// Argument order on the wire: `[target] cursor [MATCH pattern] [COUNT n] extra...`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    command: String,
    target: Option<String>,
    pattern: Option<String>,
    count: Option<usize>,
    extra: Vec<Arg>,
}

impl ScanRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            target: None,
            pattern: None,
            count: None,
            extra: Vec::new(),
        }
    }

    /// Key the command scans within (the index name for `TVS.SCAN`).
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn pattern(mut self, pattern: Option<String>) -> Self {
        self.pattern = pattern;
        self
    }

    /// Page size hint sent as `COUNT`.
    pub fn count(mut self, count: Option<usize>) -> Self {
        self.count = count;
        self
    }

    /// Extra arguments appended after `MATCH`/`COUNT`.
    pub fn extra(mut self, args: Vec<Arg>) -> Self {
        self.extra = args;
        self
    }

    /// Build the command for one page.
    pub fn page_command(&self, cursor: &str) -> Command {
        let mut cmd = Command::new(self.command.as_str());
        if let Some(target) = &self.target {
            cmd = cmd.arg(target);
        }
        cmd = cmd.arg(cursor);
        if let Some(pattern) = &self.pattern {
            cmd = cmd.arg("MATCH").arg(pattern);
        }
        if let Some(count) = self.count {
            cmd = cmd.arg("COUNT").arg(count);
        }
        cmd.args(self.extra.iter().cloned())
    }
}

#[derive(Debug)]
enum ScanState {
    /// Nothing fetched yet; the first fetch uses the sentinel cursor.
    Fresh,
    /// Yielding items of the current page. `next_cursor` is `None` once the
    /// server has returned the sentinel.
    Draining {
        page: std::vec::IntoIter<Reply>,
        next_cursor: Option<String>,
    },
    Exhausted,
}

/// Lazy, single-consumer iterator over a paginated scan.
///
/// A cursor is not restartable: once exhausted it stays exhausted. Build a
/// new one from the same [`ScanRequest`] to scan again from the start.
///
/// If a page fetch fails the error is returned and the state is left as it
/// was before the fetch. Treat the cursor as unusable after an error.
pub struct ScanCursor<'a, T: Transport> {
    transport: &'a T,
    request: ScanRequest,
    state: ScanState,
    pages_fetched: usize,
}

impl<'a, T: Transport> ScanCursor<'a, T> {
    pub fn new(transport: &'a T, request: ScanRequest) -> Self {
        Self {
            transport,
            request,
            state: ScanState::Fresh,
            pages_fetched: 0,
        }
    }

    pub fn request(&self) -> &ScanRequest {
        &self.request
    }

    /// Number of pages requested from the server so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, ScanState::Exhausted)
    }

    /// Yield the next item, fetching a new page when the current one is used up.
    pub async fn next(&mut self) -> Result<Option<Reply>, VectorError> {
        let cursor = match &mut self.state {
            ScanState::Exhausted => None,
            ScanState::Fresh => Some(SENTINEL_CURSOR.to_string()),
            ScanState::Draining { page, next_cursor } => {
                if let Some(item) = page.next() {
                    return Ok(Some(item));
                }
                next_cursor.clone()
            }
        };
        let Some(cursor) = cursor else {
            self.state = ScanState::Exhausted;
            return Ok(None);
        };

        let (next_cursor, items) = self.fetch_page(&cursor).await?;
        if items.is_empty() {
            self.state = ScanState::Exhausted;
            return Ok(None);
        }

        let mut page = items.into_iter();
        let first = page.next();
        self.state = ScanState::Draining {
            page,
            next_cursor: (next_cursor != SENTINEL_CURSOR).then_some(next_cursor),
        };
        Ok(first)
    }

    /// Drain the remaining items into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<Reply>, VectorError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Drain the remaining items, converting each bulk string to `String`.
    pub async fn collect_strings(mut self) -> Result<Vec<String>, VectorError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            let text = item.to_string_lossy().ok_or_else(|| {
                VectorError::UnexpectedReply(format!(
                    "scan item is {}, expected a string",
                    item.kind()
                ))
            })?;
            items.push(text);
        }
        Ok(items)
    }

    async fn fetch_page(&mut self, cursor: &str) -> Result<(String, Vec<Reply>), VectorError> {
        let command = self.request.page_command(cursor);
        let reply = self.transport.execute(command).await?;
        self.pages_fetched += 1;

        let (next_cursor, items) = parse_scan_reply(reply)?;
        debug!(
            command = %self.request.command,
            cursor,
            next_cursor = %next_cursor,
            items = items.len(),
            "Fetched scan page"
        );
        Ok((next_cursor, items))
    }
}

/// Split a `[next_cursor, [items...]]` reply.
pub fn parse_scan_reply(reply: Reply) -> Result<(String, Vec<Reply>), VectorError> {
    let kind = reply.kind();
    let Some(parts) = reply.into_array() else {
        return Err(VectorError::UnexpectedReply(format!(
            "scan reply is {}, expected a 2-element array",
            kind
        )));
    };
    let [cursor, items]: [Reply; 2] = parts.try_into().map_err(|parts: Vec<Reply>| {
        VectorError::UnexpectedReply(format!(
            "scan reply has {} elements, expected 2",
            parts.len()
        ))
    })?;

    let cursor = match cursor {
        Reply::Integer(n) => n.to_string(),
        other => other.to_string_lossy().ok_or_else(|| {
            VectorError::UnexpectedReply(format!("scan cursor is {}", other.kind()))
        })?,
    };
    let items = match items {
        Reply::Array(items) => items,
        Reply::Nil => Vec::new(),
        other => {
            return Err(VectorError::UnexpectedReply(format!(
                "scan page is {}, expected an array",
                other.kind()
            )));
        }
    };
    Ok((cursor, items))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Reply {
        Reply::Bulk(s.as_bytes().to_vec())
    }

    #[test]
    fn page_command_orders_arguments() {
        let req = ScanRequest::new("TVS.SCAN")
            .target("idx")
            .pattern(Some("k*".into()))
            .count(Some(10))
            .extra(vec![Arg::from("FILTER"), Arg::from("age>30")]);
        assert_eq!(
            req.page_command("17").arg_strings(),
            vec!["idx", "17", "MATCH", "k*", "COUNT", "10", "FILTER", "age>30"]
        );
    }

    #[test]
    fn page_command_without_target() {
        let req = ScanRequest::new("TVS.SCANINDEX").count(Some(5));
        let cmd = req.page_command(SENTINEL_CURSOR);
        assert_eq!(cmd.name(), "TVS.SCANINDEX");
        assert_eq!(cmd.arg_strings(), vec!["0", "COUNT", "5"]);
    }

    #[test]
    fn parses_scan_reply() {
        let reply = Reply::Array(vec![bulk("9"), Reply::Array(vec![bulk("a"), bulk("b")])]);
        let (cursor, items) = parse_scan_reply(reply).unwrap();
        assert_eq!(cursor, "9");
        assert_eq!(items, vec![bulk("a"), bulk("b")]);
    }

    #[test]
    fn integer_cursor_is_accepted() {
        let reply = Reply::Array(vec![Reply::Integer(0), Reply::Array(vec![])]);
        let (cursor, items) = parse_scan_reply(reply).unwrap();
        assert_eq!(cursor, SENTINEL_CURSOR);
        assert!(items.is_empty());
    }

    #[test]
    fn rejects_malformed_scan_reply() {
        assert!(matches!(
            parse_scan_reply(bulk("0")),
            Err(VectorError::UnexpectedReply(_))
        ));
        assert!(matches!(
            parse_scan_reply(Reply::Array(vec![bulk("0")])),
            Err(VectorError::UnexpectedReply(_))
        ));
        assert!(matches!(
            parse_scan_reply(Reply::Array(vec![bulk("0"), bulk("x")])),
            Err(VectorError::UnexpectedReply(_))
        ));
    }
}
