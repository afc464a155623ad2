//! Engine timing and capacity.

use std::time::Duration;

use copresence_settings::PresenceSettings;

/// Timing and capacity knobs shared by coordinators and sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum spacing between accepted presence updates per viewer.
    pub throttle_interval: Duration,
    /// How long a disconnected session waits for a reconnect.
    pub grace_window: Duration,
    /// How often a live session renews its lease.
    pub lease_renew_interval: Duration,
    /// Age at which an unrenewed lease is swept by the coordinator.
    pub lease_ttl: Duration,
    /// Coordinator sweep cadence.
    pub sweep_interval: Duration,
    /// Depth of each coordinator's command queue.
    pub room_queue_capacity: usize,
    /// Per-room diff buffer.
    pub broadcast_capacity: usize,
    /// Depth of each session's command queue.
    pub session_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&PresenceSettings::default())
    }
}

impl From<&PresenceSettings> for EngineConfig {
    fn from(p: &PresenceSettings) -> Self {
        Self {
            throttle_interval: Duration::from_millis(p.throttle_interval_ms),
            grace_window: Duration::from_millis(p.grace_window_ms),
            lease_renew_interval: Duration::from_millis(p.lease_renew_interval_ms),
            lease_ttl: Duration::from_millis(p.lease_ttl_ms),
            sweep_interval: Duration::from_millis(p.sweep_interval_ms),
            room_queue_capacity: p.room_queue_capacity,
            broadcast_capacity: p.broadcast_capacity,
            session_queue_capacity: 64,
        }
    }
}
