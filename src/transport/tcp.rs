//! Pooled RESP2-over-TCP transport.
//!
//! Connections are opened lazily and kept in a small idle pool so that
//! concurrent callers (the batched distance queries in particular) each get
//! their own socket. A connection that hit an I/O, protocol or timeout error
//! is dropped instead of being returned to the pool. A pooled connection the
//! server closed while it sat idle is replaced once, transparently.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::resp::{encode_command, parse_frame};
use super::{Command, Reply, Transport, TransportError};
use crate::config::ClientConfig;

const READ_CHUNK: usize = 8 * 1024;

/// A single server connection with its read buffer.
struct Connection {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Connection {
    async fn open(config: &ClientConfig) -> Result<Self, TransportError> {
        let addr = config.addr();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(config.connect_timeout))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
        };

        if let Some(password) = &config.password {
            let mut auth = Command::new("AUTH");
            if let Some(user) = &config.username {
                auth = auth.arg(user);
            }
            conn.round_trip_timed(&auth.arg(password), config).await?;
        }

        if config.db != 0 {
            conn.round_trip_timed(&Command::new("SELECT").arg(config.db), config)
                .await?;
        }

        debug!(addr = %addr, "Opened connection");
        Ok(conn)
    }

    async fn round_trip_timed(
        &mut self,
        command: &Command,
        config: &ClientConfig,
    ) -> Result<Reply, TransportError> {
        tokio::time::timeout(config.request_timeout, self.round_trip(command))
            .await
            .map_err(|_| TransportError::Timeout(config.request_timeout))?
    }

    async fn round_trip(&mut self, command: &Command) -> Result<Reply, TransportError> {
        self.stream.write_all(&encode_command(command)).await?;

        loop {
            if let Some((frame, used)) = parse_frame(&self.buf)? {
                self.buf.drain(..used);
                return frame.into_reply();
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
        }
    }
}

/// TCP transport with a bounded pool of idle connections.
pub struct TcpTransport {
    config: ClientConfig,
    idle: Mutex<Vec<Connection>>,
    request_counter: AtomicU64,
}

impl TcpTransport {
    /// Create a transport without connecting; the first command connects.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Create a transport and eagerly open (and authenticate) one connection.
    pub async fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let transport = Self::new(config);
        let conn = Connection::open(&transport.config).await?;
        transport.release(conn);
        info!(addr = %transport.config.addr(), "Connected to server");
        Ok(transport)
    }

    /// Create a transport from `TVS_*` environment variables.
    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of connections currently parked in the pool.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    fn acquire(&self) -> Option<Connection> {
        self.idle.lock().pop()
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle_connections {
            idle.push(conn);
        }
    }

    fn finish(
        &self,
        request_id: u64,
        command: &Command,
        conn: Connection,
        result: Result<Reply, TransportError>,
    ) -> Result<Reply, TransportError> {
        match &result {
            // An error reply leaves the connection in a clean state.
            Ok(_) | Err(TransportError::Server(_)) => self.release(conn),
            Err(e) => {
                warn!(request_id, command = command.name(), error = %e, "Dropping connection after failure");
            }
        }
        result
    }
}

impl Transport for TcpTransport {
    async fn execute(&self, command: Command) -> Result<Reply, TransportError> {
        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id,
            command = command.name(),
            args = command.arg_list().len(),
            "Sending command"
        );

        // The server may have closed an idle connection (idle timeout,
        // proxy, failover). An I/O failure before any reply byte arrived
        // left the command unanswered: retry once on a new connection.
        if let Some(mut conn) = self.acquire() {
            let result = conn.round_trip_timed(&command, &self.config).await;
            match result {
                Err(TransportError::Io(e)) if conn.buf.is_empty() => {
                    debug!(request_id, error = %e, "Pooled connection was closed, reconnecting");
                }
                result => return self.finish(request_id, &command, conn, result),
            }
        }

        let mut conn = Connection::open(&self.config).await?;
        let result = conn.round_trip_timed(&command, &self.config).await;
        self.finish(request_id, &command, conn, result)
    }
}
