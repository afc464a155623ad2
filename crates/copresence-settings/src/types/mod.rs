//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may name only the fields it changes.

mod auth;
mod presence;
mod server;

pub use auth::*;
pub use presence::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "presence": { "graceWindowMs": 8000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CopresenceSettings {
    /// Settings schema version.
    pub version: String,
    /// Network and transport settings.
    pub server: ServerSettings,
    /// Presence engine timing and capacity.
    pub presence: PresenceSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Built-in identity table.
    pub auth: AuthSettings,
}

impl Default for CopresenceSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            presence: PresenceSettings::default(),
            logging: LoggingSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl CopresenceSettings {
    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.presence;
        if p.grace_window_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "presence.graceWindowMs must be positive".into(),
            ));
        }
        if p.lease_renew_interval_ms == 0 || p.lease_ttl_ms <= p.lease_renew_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "presence.leaseTtlMs ({}) must exceed leaseRenewIntervalMs ({})",
                p.lease_ttl_ms, p.lease_renew_interval_ms
            )));
        }
        if p.sweep_interval_ms == 0 || p.room_queue_capacity == 0 || p.broadcast_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "presence intervals and capacities must be positive".into(),
            ));
        }
        let s = &self.server;
        if s.heartbeat_interval_ms == 0 || s.heartbeat_timeout_ms < s.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) must be at least heartbeatIntervalMs ({})",
                s.heartbeat_timeout_ms, s.heartbeat_interval_ms
            )));
        }
        // A silent socket is only noticed after up to timeout + interval.
        if s.heartbeat_timeout_ms + s.heartbeat_interval_ms > p.grace_window_ms {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat timeout + interval ({}) must not exceed presence.graceWindowMs ({})",
                s.heartbeat_timeout_ms + s.heartbeat_interval_ms,
                p.grace_window_ms
            )));
        }
        if s.outbound_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundCapacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
