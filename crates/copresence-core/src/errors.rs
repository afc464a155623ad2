//! Error taxonomy for the presence engine.
//!
//! Grace-window and lease expiry are not errors; they are state transitions
//! and never surface here.

use thiserror::Error;

use crate::ids::{RoomId, SessionToken, ViewerId};

/// Errors raised by registry, session, and transport boundaries.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// `update` or `untrack` named a viewer the room does not track.
    #[error("viewer {viewer_id} is not tracked in room {room_id}")]
    NotFound {
        /// Room that was asked.
        room_id: RoomId,
        /// Viewer that was missing.
        viewer_id: ViewerId,
    },

    /// `track` named a viewer the room already tracks.
    #[error("viewer {viewer_id} is already tracked in room {room_id}")]
    AlreadyTracked {
        /// Room that was asked.
        room_id: RoomId,
        /// Viewer that was present.
        viewer_id: ViewerId,
    },

    /// Inbound payload failed to decode or validate.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The room's coordinator task is gone.
    #[error("room {0} is unavailable")]
    RoomUnavailable(RoomId),

    /// A subscriber fell behind and missed diffs.
    #[error("delivery gap: {skipped} diffs skipped")]
    DeliveryGap {
        /// How many diffs were lost.
        skipped: u64,
    },

    /// The session has already been removed.
    #[error("session {0} is closed")]
    SessionClosed(SessionToken),
}

impl PresenceError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyTracked { .. } => "ALREADY_TRACKED",
            Self::MalformedInput(_) => "MALFORMED_INPUT",
            Self::RoomUnavailable(_) => "ROOM_UNAVAILABLE",
            Self::DeliveryGap { .. } => "DELIVERY_GAP",
            Self::SessionClosed(_) => "SESSION_CLOSED",
        }
    }

    /// Whether re-announcing into a fresh coordinator can fix this.
    #[must_use]
    pub fn needs_reannounce(&self) -> bool {
        matches!(self, Self::RoomUnavailable(_) | Self::NotFound { .. })
    }
}

/// Result type for presence operations.
pub type Result<T> = std::result::Result<T, PresenceError>;
