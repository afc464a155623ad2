//! Minimum-interval discard throttle.
//!
//! An update arriving less than `interval` after the last *accepted* one is
//! dropped for good: never queued, never replayed. Anything at or past the
//! interval is accepted and becomes the new baseline.

use std::time::Duration;

use tokio::time::Instant;

/// Per-viewer update gate.
#[derive(Clone, Debug)]
pub struct Throttle {
    interval: Duration,
    last_accepted: Option<Instant>,
    discarded: u64,
}

impl Throttle {
    /// Gate with the given minimum spacing. A zero interval admits everything.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: None,
            discarded: 0,
        }
    }

    /// Decide whether an update arriving at `now` goes through.
    pub fn admit(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.interval {
                self.discarded += 1;
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }

    /// Updates dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Configured spacing.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
