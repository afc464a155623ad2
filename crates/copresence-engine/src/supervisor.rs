//! Reconnection timers.
//!
//! A [`GraceTimer`] is armed when a viewer's transport drops and cancelled
//! when it comes back. It lives inside the session actor's `select!` loop,
//! so an unarmed timer must never complete.

use std::future;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Deadline for a disconnected viewer to reconnect.
#[derive(Debug, Default)]
pub struct GraceTimer {
    deadline: Option<Instant>,
}

impl GraceTimer {
    /// Unarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting `window` from now. Re-arming moves the deadline.
    pub fn arm(&mut self, window: Duration) -> Instant {
        let deadline = Instant::now() + window;
        self.deadline = Some(deadline);
        deadline
    }

    /// Stop the timer. Returns whether it was running.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Whether a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left, if armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves at the deadline; pending forever while unarmed.
    ///
    /// Does not disarm. The caller cancels once it has acted on expiry.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending::<()>().await,
        }
    }
}

/// Ticker for lease renewal. The first tick fires one full period from now.
pub fn lease_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
