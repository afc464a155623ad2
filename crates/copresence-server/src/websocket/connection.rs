//! Per-socket bookkeeping: liveness and frame counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use copresence_core::{RoomId, SessionToken, ViewerId};
use parking_lot::Mutex;
use tokio::time::Instant;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// One open viewer socket.
pub struct ClientConnection {
    /// Process-unique connection id, for logs.
    pub id: String,
    /// Room the socket was opened against.
    pub room_id: RoomId,
    /// Session attached to this socket, once the hub has placed it.
    session: Mutex<Option<(SessionToken, ViewerId)>>,
    /// When the socket was accepted.
    pub connected_at: Instant,
    /// Whether the client has shown signs of life since the last check.
    pub is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    frames: AtomicU64,
    malformed: AtomicU64,
}

impl ClientConnection {
    /// New connection for `room_id`, alive as of now.
    pub fn new(room_id: RoomId) -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Self {
            id: format!("conn-{n}"),
            room_id,
            session: Mutex::new(None),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            frames: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Record which session this socket drives.
    pub fn bind_session(&self, token: SessionToken, viewer_id: ViewerId) {
        *self.session.lock() = Some((token, viewer_id));
    }

    /// Bound session token.
    pub fn session_token(&self) -> Option<SessionToken> {
        self.session.lock().as_ref().map(|(t, _)| t.clone())
    }

    /// Bound viewer.
    pub fn viewer_id(&self) -> Option<ViewerId> {
        self.session.lock().as_ref().map(|(_, v)| v.clone())
    }

    /// Any inbound frame counts as life.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Read and clear the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound frame (or since accept).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Count an inbound frame.
    pub fn record_frame(&self) -> u64 {
        self.frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a frame that failed to decode.
    pub fn record_malformed(&self) -> u64 {
        self.malformed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Inbound frames so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Malformed frames so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
