//! Presence engine timing and capacity settings.

use serde::{Deserialize, Serialize};

/// Presence engine timing and capacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Minimum spacing between accepted cursor/selection updates per viewer.
    pub throttle_interval_ms: u64,
    /// How long a disconnected viewer may take to reconnect.
    pub grace_window_ms: u64,
    /// How often a live session renews its lease.
    pub lease_renew_interval_ms: u64,
    /// Age at which an unrenewed lease is swept.
    pub lease_ttl_ms: u64,
    /// How often room coordinators sweep leases.
    pub sweep_interval_ms: u64,
    /// Depth of each room coordinator's command queue.
    pub room_queue_capacity: usize,
    /// Per-room diff buffer before slow subscribers lag.
    pub broadcast_capacity: usize,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            throttle_interval_ms: 100,
            grace_window_ms: 5_000,
            lease_renew_interval_ms: 5_000,
            lease_ttl_ms: 15_000,
            sweep_interval_ms: 1_000,
            room_queue_capacity: 256,
            broadcast_capacity: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let p = PresenceSettings::default();
        assert_eq!(p.throttle_interval_ms, 100);
        assert_eq!(p.grace_window_ms, 5_000);
        assert!(p.lease_ttl_ms > p.lease_renew_interval_ms);
    }

    #[test]
    fn partial_json() {
        let p: PresenceSettings = serde_json::from_str(r#"{"throttleIntervalMs": 50}"#).unwrap();
        assert_eq!(p.throttle_interval_ms, 50);
        assert_eq!(p.grace_window_ms, 5_000);
    }
}
