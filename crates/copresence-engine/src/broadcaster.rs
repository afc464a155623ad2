//! Per-room diff fan-out.
//!
//! Fire-and-forget: the coordinator publishes and moves on. Because only the
//! room's coordinator publishes, every subscriber sees the room's diffs in
//! the same order. A subscriber that falls more than `capacity` diffs behind
//! gets a [`PresenceError::DeliveryGap`] and must resync from a snapshot;
//! nobody else notices.

use std::sync::Arc;

use copresence_core::{PresenceError, PresenceEvent, Result, RoomId};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

/// Sending half, owned by one room coordinator.
pub struct DiffBroadcaster {
    room_id: RoomId,
    tx: broadcast::Sender<Arc<PresenceEvent>>,
}

impl DiffBroadcaster {
    /// Channel buffering up to `capacity` diffs per subscriber.
    pub fn new(room_id: RoomId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { room_id, tx }
    }

    /// Deliver to every current subscriber. Returns how many there were.
    pub fn publish(&self, event: PresenceEvent) -> usize {
        let seq = event.seq;
        match self.tx.send(Arc::new(event)) {
            Ok(recipients) => {
                trace!(room_id = %self.room_id, seq, recipients, "diff published");
                recipients
            }
            Err(_) => {
                debug!(room_id = %self.room_id, seq, "no subscribers for diff");
                0
            }
        }
    }

    /// New subscription that sees every diff published after this call.
    pub fn subscribe(&self) -> DiffSubscription {
        DiffSubscription {
            room_id: self.room_id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving half held by one session.
#[derive(Debug)]
pub struct DiffSubscription {
    room_id: RoomId,
    rx: broadcast::Receiver<Arc<PresenceEvent>>,
}

impl DiffSubscription {
    /// Next diff.
    ///
    /// `DeliveryGap` if diffs were skipped (the subscription stays usable
    /// and resumes at the oldest retained diff); `RoomUnavailable` once the
    /// coordinator is gone.
    pub async fn recv(&mut self) -> Result<Arc<PresenceEvent>> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(RecvError::Lagged(skipped)) => Err(PresenceError::DeliveryGap { skipped }),
            Err(RecvError::Closed) => Err(PresenceError::RoomUnavailable(self.room_id.clone())),
        }
    }

    /// Room this subscription belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}
