//! Connection configuration for the TCP transport.
//!
//! Values come from `TVS_*` environment variables (a `.env` file is honoured
//! through `dotenvy`); anything missing or unparseable keeps its default.

use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;

/// Configuration for [`crate::transport::TcpTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Username for `AUTH` (ACL style); only used together with a password.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database selected on each new connection (0 = no SELECT).
    pub db: u32,
    pub connect_timeout: Duration,
    /// Upper bound on a single request/reply round trip.
    pub request_timeout: Duration,
    /// Idle connections kept for reuse.
    pub max_idle_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            max_idle_connections: 8,
        }
    }
}

impl ClientConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(host) = dotenvy::var("TVS_HOST")
            && !host.trim().is_empty()
        {
            cfg.host = host.trim().to_string();
        }

        if let Ok(val) = dotenvy::var("TVS_PORT")
            && let Ok(port) = val.parse()
        {
            cfg.port = port;
        }

        if let Ok(user) = dotenvy::var("TVS_USERNAME")
            && !user.is_empty()
        {
            cfg.username = Some(user);
        }

        if let Ok(password) = dotenvy::var("TVS_PASSWORD")
            && !password.is_empty()
        {
            cfg.password = Some(password);
        }

        if let Ok(val) = dotenvy::var("TVS_DB")
            && let Ok(db) = val.parse()
        {
            cfg.db = db;
        }

        if let Ok(val) = dotenvy::var("TVS_CONNECT_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.connect_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("TVS_REQUEST_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.request_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("TVS_MAX_IDLE_CONNECTIONS")
            && let Ok(n) = val.parse()
        {
            cfg.max_idle_connections = n;
        }

        cfg
    }

    /// `host:port` string used for connecting and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:6379");
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.password.is_none());
        assert_eq!(config.db, 0);
    }
}
