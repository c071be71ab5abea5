//! RESP2 wire encoding for commands and replies.
//!
//! Commands are always sent as an array of bulk strings. Replies are parsed
//! incrementally: [`parse_frame`] returns `Ok(None)` until the buffer holds a
//! complete frame, so the caller can keep reading from the socket.

use super::{Command, Reply, TransportError};

/// Sanity limit for a single bulk string (matches the server's default
/// `proto-max-bulk-len`).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// One decoded RESP2 frame, before error replies are split out.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Convert into a [`Reply`]. An error frame anywhere in the tree becomes
    /// [`TransportError::Server`].
    pub fn into_reply(self) -> Result<Reply, TransportError> {
        match self {
            Frame::Simple(s) => Ok(Reply::Status(s)),
            Frame::Error(msg) => Err(TransportError::Server(msg)),
            Frame::Integer(n) => Ok(Reply::Integer(n)),
            Frame::Bulk(None) | Frame::Array(None) => Ok(Reply::Nil),
            Frame::Bulk(Some(bytes)) => Ok(Reply::Bulk(bytes)),
            Frame::Array(Some(items)) => items
                .into_iter()
                .map(Frame::into_reply)
                .collect::<Result<Vec<_>, _>>()
                .map(Reply::Array),
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let args = command.arg_list();
    let payload_len: usize = args.iter().map(|a| a.as_bytes().len() + 16).sum();
    let mut buf = Vec::with_capacity(command.name().len() + payload_len + 16);

    buf.push(b'*');
    buf.extend_from_slice((args.len() + 1).to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    write_bulk(&mut buf, command.name().as_bytes());
    for arg in args {
        write_bulk(&mut buf, arg.as_bytes());
    }
    buf
}

fn write_bulk(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(b'$');
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(CRLF);
}

/// Try to parse one frame from the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when the
/// buffer does not yet contain a complete frame.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, TransportError> {
    parse_at(buf, 0)
}

fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, TransportError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((Frame::Simple(line_to_string(line)?), next))),
        b'-' => Ok(Some((Frame::Error(line_to_string(line)?), next))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Frame::Bulk(None), next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(TransportError::Protocol(format!(
                    "bulk string too large: {} bytes",
                    len
                )));
            }
            let end = next + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(TransportError::Protocol(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            Ok(Some((
                Frame::Bulk(Some(buf[next..end].to_vec())),
                end + CRLF.len(),
            )))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Frame::Array(None), next)));
            }
            let count = count as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut at = next;
            for _ in 0..count {
                match parse_at(buf, at)? {
                    Some((frame, after)) => {
                        items.push(frame);
                        at = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(Some(items)), at)))
        }
        other => Err(TransportError::Protocol(format!(
            "unexpected reply type byte 0x{:02x}",
            other
        ))),
    }
}

fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    rest.windows(CRLF.len())
        .position(|w| w == CRLF)
        .map(|i| (&rest[..i], start + i + CRLF.len()))
}

fn line_to_string(line: &[u8]) -> Result<String, TransportError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|e| TransportError::Protocol(format!("invalid UTF-8 in reply line: {}", e)))
}

fn parse_int(line: &[u8]) -> Result<i64, TransportError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            TransportError::Protocol(format!(
                "invalid integer in reply: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
