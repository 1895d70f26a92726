//! Built-in defaults (layer 1)

use serde_json::{json, Value};

use crate::filestream::{DEFAULT_MAX_LINE_BYTES, MAX_ITEMS_PER_PUSH};
use crate::sock::AcceptMode;

/// Built-in default configuration values
#[derive(Debug, Clone)]
pub struct BuiltinDefaults {
    /// Interface the socket server binds to
    pub host: String,

    /// Port the socket server binds to (0 = ephemeral)
    pub port: u16,

    /// Serve only the first accepted connection
    pub accept_mode: AcceptMode,

    /// Result relay poll interval in milliseconds
    pub relay_poll_ms: u64,

    /// Collector base URL
    pub base_url: String,

    /// Per-request HTTP timeout in seconds
    pub http_timeout_seconds: u64,

    /// Heartbeat interval in seconds until the collector says otherwise
    pub heartbeat_seconds: f64,

    /// Maximum queue items drained per worker iteration
    pub max_items_per_push: usize,

    /// Maximum size of a single line or request payload
    pub max_line_bytes: usize,

    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            accept_mode: AcceptMode::Single,
            relay_poll_ms: 1000,
            base_url: "https://api.example.com".to_string(),
            http_timeout_seconds: 10,
            heartbeat_seconds: 30.0,
            max_items_per_push: MAX_ITEMS_PER_PUSH,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_retries: 30,
            retry_initial_delay_ms: 2_000,
            retry_max_delay_ms: 300_000,
            retry_jitter: 0.25,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to the layered JSON shape used for merging
    pub fn to_value(&self) -> Value {
        json!({
            "server": {
                "host": self.host,
                "port": self.port,
                "accept_mode": self.accept_mode,
                "relay_poll_ms": self.relay_poll_ms,
            },
            "api": {
                "base_url": self.base_url,
                "http_timeout_seconds": self.http_timeout_seconds,
            },
            "filestream": {
                "heartbeat_seconds": self.heartbeat_seconds,
                "max_items_per_push": self.max_items_per_push,
                "max_line_bytes": self.max_line_bytes,
                "retry": {
                    "max_retries": self.max_retries,
                    "initial_delay_ms": self.retry_initial_delay_ms,
                    "max_delay_ms": self.retry_max_delay_ms,
                    "jitter": self.retry_jitter,
                }
            }
        })
    }
}
