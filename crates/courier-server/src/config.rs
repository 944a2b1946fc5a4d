//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_IDENTITY_HEADER};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None`, meaning the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Number of pooled database connections.
    /// Env: `DB_POOL_SIZE`
    /// Default: `4`
    pub db_pool_size: usize,

    /// How long a writer waits for the SQLite lock.
    /// Env: `DB_BUSY_TIMEOUT_MS`
    /// Default: `5000`
    pub db_busy_timeout: Duration,

    /// Header carrying the user id resolved by the upstream auth proxy.
    /// Env: `IDENTITY_HEADER`
    /// Default: `x-user-id`
    pub identity_header: String,

    /// Message writes allowed per user per window.
    /// Env: `MESSAGE_RATE_LIMIT`
    /// Default: `50`
    pub message_rate_limit: u32,

    /// Env: `MESSAGE_RATE_WINDOW_SECS`
    /// Default: `60`
    pub message_rate_window: Duration,

    /// Domain events buffered between the write path and fanout.
    /// Env: `FANOUT_QUEUE_CAPACITY`
    /// Default: `1024`
    pub fanout_queue_capacity: usize,

    /// Outbound frames buffered per live connection before drops.
    /// Env: `CONNECTION_BUFFER`
    /// Default: `256`
    pub connection_buffer: usize,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Courier"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            db_pool_size: 4,
            db_busy_timeout: Duration::from_millis(5000),
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            message_rate_limit: 50,
            message_rate_window: Duration::from_secs(60),
            fanout_queue_capacity: 1024,
            connection_buffer: 256,
            instance_name: "Courier".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        parse_into(&lookup, "DB_POOL_SIZE", &mut config.db_pool_size);
        if config.db_pool_size == 0 {
            tracing::warn!("DB_POOL_SIZE must be at least 1, using 1");
            config.db_pool_size = 1;
        }

        let mut busy_ms = config.db_busy_timeout.as_millis() as u64;
        parse_into(&lookup, "DB_BUSY_TIMEOUT_MS", &mut busy_ms);
        config.db_busy_timeout = Duration::from_millis(busy_ms);

        if let Some(header) = lookup("IDENTITY_HEADER") {
            if !header.is_empty() {
                config.identity_header = header.to_ascii_lowercase();
            }
        }

        parse_into(&lookup, "MESSAGE_RATE_LIMIT", &mut config.message_rate_limit);

        let mut window_secs = config.message_rate_window.as_secs();
        parse_into(&lookup, "MESSAGE_RATE_WINDOW_SECS", &mut window_secs);
        config.message_rate_window = Duration::from_secs(window_secs.max(1));

        parse_into(&lookup, "FANOUT_QUEUE_CAPACITY", &mut config.fanout_queue_capacity);
        config.fanout_queue_capacity = config.fanout_queue_capacity.max(1);

        parse_into(&lookup, "CONNECTION_BUFFER", &mut config.connection_buffer);
        config.connection_buffer = config.connection_buffer.max(1);

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `target` with the parsed value of `key`, keeping the default
/// (with a warning) when the value does not parse.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}
