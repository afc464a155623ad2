//! # copresence-core
//!
//! Shared vocabulary for live co-presence on a read-only document.
//!
//! - **Branded IDs**: `RoomId`, `ViewerId`, `SessionToken` as newtypes for type safety
//! - **Presence records**: `PresenceRecord`, cursor `Position`, `Selection`, and
//!   `PresencePatch` for partial updates
//! - **Diffs**: `PresenceDiff` (joins/leaves with replace semantics), the
//!   sequenced `PresenceEvent` envelope, and `PresenceView` for idempotent merge
//! - **Wire events**: inbound `ClientCommand` and outbound `ServerEvent`
//! - **Errors**: `PresenceError` via `thiserror`

#![deny(unsafe_code)]

pub mod diff;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod presence;

pub use diff::{PresenceDiff, PresenceEvent, PresenceView};
pub use errors::{PresenceError, Result};
pub use events::{ClientCommand, ServerEvent, Snapshot};
pub use ids::{RoomId, SessionToken, ViewerId};
pub use presence::{ConnectionState, PresencePatch, PresenceRecord, Position, Selection};
