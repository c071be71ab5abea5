//! Request/response transport consumed by the vector client.
//!
//! The vector engine only ever needs one operation from the server side:
//! send a command with its arguments and get a loosely typed reply back.
//! That operation is the [`Transport`] trait. The crate ships one
//! implementation speaking RESP2 over TCP ([`tcp::TcpTransport`]); tests use
//! scripted in-memory transports.
//!
//! - **[`resp`]**: RESP2 command encoding and incremental reply parsing.
//! - **[`tcp`]**: pooled TCP transport with timeouts and optional AUTH/SELECT.

pub mod resp;
pub mod tcp;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use tcp::TcpTransport;

/// Errors raised by a transport while executing a command.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// Loosely typed reply tree returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Integer(i64),
    /// Simple status string such as `OK`.
    Status(String),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
}

impl Reply {
    /// Borrow the payload of a bulk or status reply as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(bytes) => Some(bytes),
            Reply::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of a bulk or status reply.
    pub fn to_string_lossy(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Short name of the reply variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::Integer(_) => "integer",
            Reply::Status(_) => "status",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
        }
    }
}

/// One command argument, already rendered to its wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg(Vec<u8>);

impl Arg {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

macro_rules! arg_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Self(value.to_string().into_bytes())
                }
            }
        )*
    };
}

arg_from_display!(usize, u32, u64, i32, i64, f64);

/// A command name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_list(&self) -> &[Arg] {
        &self.args
    }

    /// Arguments as lossy strings, handy for logging and assertions.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| String::from_utf8_lossy(a.as_bytes()).into_owned())
            .collect()
    }
}

/// The single operation the vector engine needs from the server side.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<Reply, TransportError>> + Send;
}
