//! Server network and transport settings.

use serde::{Deserialize, Serialize};

/// Server network and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent viewer sockets.
    pub max_connections: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a socket is treated as lost, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Per-socket outbound queue depth.
    pub outbound_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4040,
            max_connections: 1000,
            heartbeat_interval_ms: 1_500,
            heartbeat_timeout_ms: 3_000,
            max_message_size: 64 * 1024,
            outbound_capacity: 256,
        }
    }
}
