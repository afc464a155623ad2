//! # copresence-engine
//!
//! Runtime for live co-presence on a read-only document.
//!
//! - **Room registry** ([`room`], [`directory`]): one coordinator task per
//!   room owns its records, assigns anonymous numbers, and sweeps stale leases
//! - **Diff broadcaster** ([`broadcaster`]): ordered per-room fan-out with
//!   gap detection for slow subscribers
//! - **Sessions** ([`session`]): one actor per connection, with throttling,
//!   a grace window on transport loss, and re-announce after coordinator loss
//! - **Hub** ([`hub`]): resolves callers and routes them to new or resumed
//!   sessions

#![deny(unsafe_code)]

pub mod broadcaster;
pub mod config;
pub mod directory;
pub mod hub;
pub mod identity;
pub mod room;
pub mod session;
pub mod supervisor;
pub mod throttle;

pub use broadcaster::{DiffBroadcaster, DiffSubscription};
pub use config::EngineConfig;
pub use directory::RoomDirectory;
pub use hub::PresenceHub;
pub use identity::{
    AnonymousResolver, CallerContext, IdentityResolver, ResolvedIdentity, StaticTokenResolver,
};
pub use room::{Joined, RoomHandle, RoomSnapshot, TrackMetadata, TrackRef};
pub use session::{SessionHandle, SessionState};
pub use throttle::Throttle;
