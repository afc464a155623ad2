//! Room registry: one coordinator task per room owns the membership table.
//!
//! Every mutation is a message on the coordinator's queue, so a room's
//! records are only ever touched by one task. Each mutation bumps the room
//! sequence and publishes exactly one diff; the sequence is the total order
//! subscribers observe.
//!
//! Records carry a lease. Sessions renew it; the coordinator sweeps leases
//! that were not renewed in time and emits the leave itself.
//!
//! Records created through [`RoomHandle::join`] remember the session that
//! owns them. A re-announce is only accepted over an existing record by its
//! owner, so two sessions can never drive the same viewer id.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use copresence_core::{
    ConnectionState, PresenceDiff, PresenceError, PresenceEvent, PresencePatch, PresenceRecord,
    Position, Result, RoomId, Selection, SessionToken, ViewerId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::broadcaster::{DiffBroadcaster, DiffSubscription};
use crate::config::EngineConfig;
use crate::identity::{ResolvedIdentity, account_color, anonymous_color, anonymous_label};

/// Fields a caller supplies when tracking a viewer.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackMetadata {
    /// Label shown next to the cursor.
    pub display_name: String,
    /// Cursor color.
    pub color: String,
    /// Initial cursor.
    pub cursor: Option<Position>,
    /// Initial selection.
    pub selection: Option<Selection>,
    /// Initial transport state.
    pub connection_state: ConnectionState,
    /// Anonymous counter value, if any.
    pub anonymous_number: Option<u64>,
}

impl TrackMetadata {
    /// Metadata with just a label and color.
    pub fn new(display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            color: color.into(),
            cursor: None,
            selection: None,
            connection_state: ConnectionState::Active,
            anonymous_number: None,
        }
    }
}

impl From<&PresenceRecord> for TrackMetadata {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            display_name: record.display_name.clone(),
            color: record.color.clone(),
            cursor: record.cursor,
            selection: record.selection,
            connection_state: record.connection_state,
            anonymous_number: record.anonymous_number,
        }
    }
}

/// Receipt for a successful `track`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackRef {
    /// Viewer that was tracked.
    pub viewer_id: ViewerId,
    /// Sequence of the join diff.
    pub seq: u64,
}

/// Point-in-time membership.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomSnapshot {
    /// Sequence the snapshot reflects.
    pub seq: u64,
    /// Records ordered by viewer id.
    pub records: Vec<PresenceRecord>,
}

/// Result of an atomic join: the caller's record, what the room looked like
/// just before it, and a subscription that starts with the caller's own join.
#[derive(Debug)]
pub struct Joined {
    /// The newly tracked record.
    pub record: PresenceRecord,
    /// Membership before the join.
    pub snapshot: RoomSnapshot,
    /// Diffs from the join onward.
    pub subscription: DiffSubscription,
}

pub(crate) enum RoomCommand {
    Join {
        identity: ResolvedIdentity,
        owner: SessionToken,
        reply: oneshot::Sender<Result<Joined>>,
    },
    Track {
        viewer_id: ViewerId,
        metadata: TrackMetadata,
        reply: oneshot::Sender<Result<TrackRef>>,
    },
    Reannounce {
        viewer_id: ViewerId,
        metadata: TrackMetadata,
        owner: SessionToken,
        reply: oneshot::Sender<Result<(RoomSnapshot, DiffSubscription)>>,
    },
    Update {
        viewer_id: ViewerId,
        patch: PresencePatch,
        reply: oneshot::Sender<Result<PresenceRecord>>,
    },
    Untrack {
        viewer_id: ViewerId,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Resync {
        reply: oneshot::Sender<(RoomSnapshot, DiffSubscription)>,
    },
    RenewLease {
        viewer_id: ViewerId,
    },
    Shutdown,
}

struct Entry {
    record: PresenceRecord,
    lease_expires: Instant,
    owner: Option<SessionToken>,
}

/// Membership table. Only the coordinator task holds one.
struct RoomState {
    room_id: RoomId,
    entries: BTreeMap<ViewerId, Entry>,
    anonymous_counter: u64,
    seq: u64,
    broadcaster: DiffBroadcaster,
    members: Arc<AtomicUsize>,
    /// Mirror of `anonymous_counter`, read when a replacement is spawned.
    counter: Arc<AtomicU64>,
    lease_ttl: Duration,
}

impl RoomState {
    fn new(room_id: RoomId, config: &EngineConfig, shared: &SharedCounts) -> Self {
        Self {
            broadcaster: DiffBroadcaster::new(room_id.clone(), config.broadcast_capacity),
            room_id,
            entries: BTreeMap::new(),
            anonymous_counter: shared.counter.load(Ordering::Acquire),
            seq: 0,
            members: shared.members.clone(),
            counter: shared.counter.clone(),
            lease_ttl: config.lease_ttl,
        }
    }

    fn set_anonymous_counter(&mut self, n: u64) {
        self.anonymous_counter = n;
        self.counter.store(n, Ordering::Release);
    }

    /// Apply one command. Returns `false` when the coordinator should stop.
    fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Join {
                identity,
                owner,
                reply,
            } => {
                let _ = reply.send(self.join(identity, owner));
            }
            RoomCommand::Track {
                viewer_id,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.track(viewer_id, metadata, None));
            }
            RoomCommand::Reannounce {
                viewer_id,
                metadata,
                owner,
                reply,
            } => {
                let _ = reply.send(self.reannounce(viewer_id, metadata, owner));
            }
            RoomCommand::Update {
                viewer_id,
                patch,
                reply,
            } => {
                let _ = reply.send(self.update(&viewer_id, &patch));
            }
            RoomCommand::Untrack { viewer_id, reply } => {
                let _ = reply.send(self.untrack(&viewer_id));
            }
            RoomCommand::List { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Resync { reply } => {
                let subscription = self.broadcaster.subscribe();
                let _ = reply.send((self.snapshot(), subscription));
            }
            RoomCommand::RenewLease { viewer_id } => self.renew(&viewer_id),
            RoomCommand::Shutdown => return false,
        }
        true
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            seq: self.seq,
            records: self.entries.values().map(|e| e.record.clone()).collect(),
        }
    }

    fn emit(&mut self, diff: PresenceDiff) -> u64 {
        self.members.store(self.entries.len(), Ordering::Release);
        self.seq += 1;
        let _ = self.broadcaster.publish(PresenceEvent {
            room_id: self.room_id.clone(),
            seq: self.seq,
            diff,
        });
        self.seq
    }

    fn lease_deadline(&self) -> Instant {
        Instant::now() + self.lease_ttl
    }

    fn track(
        &mut self,
        viewer_id: ViewerId,
        metadata: TrackMetadata,
        owner: Option<SessionToken>,
    ) -> Result<TrackRef> {
        if self.entries.contains_key(&viewer_id) {
            return Err(PresenceError::AlreadyTracked {
                room_id: self.room_id.clone(),
                viewer_id,
            });
        }
        if let Some(n) = metadata.anonymous_number.filter(|n| *n > self.anonymous_counter) {
            self.set_anonymous_counter(n);
        }
        let now = Utc::now();
        let record = PresenceRecord {
            viewer_id: viewer_id.clone(),
            display_name: metadata.display_name,
            color: metadata.color,
            cursor: metadata.cursor,
            selection: metadata.selection,
            joined_at: now,
            last_update_at: now,
            connection_state: metadata.connection_state,
            anonymous_number: metadata.anonymous_number,
        };
        let lease_expires = self.lease_deadline();
        let _ = self.entries.insert(
            viewer_id.clone(),
            Entry {
                record: record.clone(),
                lease_expires,
                owner,
            },
        );
        let seq = self.emit(PresenceDiff::join(record));
        debug!(room_id = %self.room_id, %viewer_id, seq, "viewer tracked");
        Ok(TrackRef { viewer_id, seq })
    }

    fn join(&mut self, identity: ResolvedIdentity, owner: SessionToken) -> Result<Joined> {
        let (viewer_id, metadata) = match identity {
            ResolvedIdentity::Authenticated {
                stable_id,
                display_label,
            } => {
                let color = account_color(&stable_id);
                (stable_id, TrackMetadata::new(display_label, color))
            }
            ResolvedIdentity::Anonymous => {
                let n = self.next_anonymous_number();
                let mut metadata = TrackMetadata::new(anonymous_label(n), anonymous_color(n));
                metadata.anonymous_number = Some(n);
                (ViewerId::anonymous(n), metadata)
            }
        };
        if self.entries.contains_key(&viewer_id) {
            return Err(PresenceError::AlreadyTracked {
                room_id: self.room_id.clone(),
                viewer_id,
            });
        }
        let snapshot = self.snapshot();
        let subscription = self.broadcaster.subscribe();
        let _ = self.track(viewer_id.clone(), metadata, Some(owner))?;
        let record = self
            .entries
            .get(&viewer_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| PresenceError::NotFound {
                room_id: self.room_id.clone(),
                viewer_id,
            })?;
        Ok(Joined {
            record,
            snapshot,
            subscription,
        })
    }

    /// Next unused anonymous number. Never hands out a number still held by
    /// a live record.
    fn next_anonymous_number(&mut self) -> u64 {
        let mut n = self.anonymous_counter;
        loop {
            n += 1;
            if !self.entries.contains_key(&ViewerId::anonymous(n)) {
                self.set_anonymous_counter(n);
                return n;
            }
        }
    }

    /// Track a carried-over record. If the id is already present and owned
    /// by `owner`, the existing record is kept and only a fresh snapshot and
    /// subscription are handed back.
    fn reannounce(
        &mut self,
        viewer_id: ViewerId,
        metadata: TrackMetadata,
        owner: SessionToken,
    ) -> Result<(RoomSnapshot, DiffSubscription)> {
        let lease_expires = self.lease_deadline();
        if let Some(entry) = self.entries.get_mut(&viewer_id) {
            if entry.owner.as_ref() != Some(&owner) {
                return Err(PresenceError::AlreadyTracked {
                    room_id: self.room_id.clone(),
                    viewer_id,
                });
            }
            entry.lease_expires = lease_expires;
            return Ok((self.snapshot(), self.broadcaster.subscribe()));
        }
        let snapshot = self.snapshot();
        let subscription = self.broadcaster.subscribe();
        let _ = self.track(viewer_id, metadata, Some(owner))?;
        Ok((snapshot, subscription))
    }

    fn update(&mut self, viewer_id: &ViewerId, patch: &PresencePatch) -> Result<PresenceRecord> {
        let lease_expires = self.lease_deadline();
        let Some(entry) = self.entries.get_mut(viewer_id) else {
            return Err(PresenceError::NotFound {
                room_id: self.room_id.clone(),
                viewer_id: viewer_id.clone(),
            });
        };
        entry.lease_expires = lease_expires;
        let old = entry.record.clone();
        if !entry.record.apply_patch(patch, Utc::now()) {
            return Ok(old);
        }
        let new = entry.record.clone();
        let seq = self.emit(PresenceDiff::replace(old, new.clone()));
        trace!(room_id = %self.room_id, %viewer_id, seq, "viewer updated");
        Ok(new)
    }

    fn untrack(&mut self, viewer_id: &ViewerId) -> bool {
        let Some(entry) = self.entries.remove(viewer_id) else {
            return false;
        };
        let seq = self.emit(PresenceDiff::leave(entry.record));
        debug!(room_id = %self.room_id, %viewer_id, seq, "viewer untracked");
        self.reset_if_drained();
        true
    }

    fn renew(&mut self, viewer_id: &ViewerId) {
        let lease_expires = self.lease_deadline();
        if let Some(entry) = self.entries.get_mut(viewer_id) {
            entry.lease_expires = lease_expires;
        }
    }

    /// Remove every record whose lease ran out before `now`.
    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<ViewerId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.lease_expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for viewer_id in &expired {
            if let Some(entry) = self.entries.remove(viewer_id) {
                let seq = self.emit(PresenceDiff::leave(entry.record));
                warn!(room_id = %self.room_id, %viewer_id, seq, "lease expired, viewer removed");
            }
        }
        if !expired.is_empty() {
            self.reset_if_drained();
        }
        expired.len()
    }

    fn reset_if_drained(&mut self) {
        if self.entries.is_empty() && self.anonymous_counter != 0 {
            debug!(room_id = %self.room_id, "room drained, anonymous counter reset");
            self.set_anonymous_counter(0);
        }
    }
}

#[instrument(skip_all, fields(room_id = %state.room_id))]
async fn run_coordinator(
    mut state: RoomState,
    mut rx: mpsc::Receiver<RoomCommand>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("room coordinator started");
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => {
                    if !state.handle(cmd) {
                        break;
                    }
                }
                None => break,
            },
            _ = sweep.tick() => {
                let _ = state.sweep(Instant::now());
            }
        }
    }
    info!(members = state.entries.len(), "room coordinator stopped");
}

/// Counters the coordinator publishes for lock-free reads.
#[derive(Default)]
struct SharedCounts {
    members: Arc<AtomicUsize>,
    counter: Arc<AtomicU64>,
}

struct RoomInner {
    room_id: RoomId,
    tx: mpsc::Sender<RoomCommand>,
    shared: SharedCounts,
}

/// Cloneable handle to a room's coordinator. All access goes through here.
#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<RoomInner>,
}

impl RoomHandle {
    /// Start a coordinator task for `room_id`.
    pub fn spawn(room_id: RoomId, config: &EngineConfig) -> Self {
        Self::spawn_with(room_id, config, SharedCounts::default())
    }

    /// Start a coordinator replacing this one. The anonymous counter carries
    /// over, so fresh joins cannot take a number that a surviving session
    /// is about to re-announce.
    pub fn respawn(&self, config: &EngineConfig) -> Self {
        let shared = SharedCounts {
            members: Arc::default(),
            counter: Arc::new(AtomicU64::new(self.anonymous_counter())),
        };
        Self::spawn_with(self.inner.room_id.clone(), config, shared)
    }

    fn spawn_with(room_id: RoomId, config: &EngineConfig, shared: SharedCounts) -> Self {
        let (tx, rx) = mpsc::channel(config.room_queue_capacity.max(1));
        let state = RoomState::new(room_id.clone(), config, &shared);
        drop(tokio::spawn(run_coordinator(state, rx, config.sweep_interval)));
        Self {
            inner: Arc::new(RoomInner { room_id, tx, shared }),
        }
    }

    /// Room this handle addresses.
    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    fn unavailable(&self) -> PresenceError {
        PresenceError::RoomUnavailable(self.inner.room_id.clone())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(make(reply))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Register a new record and emit its join. Fails if already tracked.
    pub async fn track(&self, viewer_id: ViewerId, metadata: TrackMetadata) -> Result<TrackRef> {
        self.request(|reply| RoomCommand::Track {
            viewer_id,
            metadata,
            reply,
        })
        .await?
    }

    /// Merge `patch` into an existing record and emit the update.
    pub async fn update(&self, viewer_id: ViewerId, patch: PresencePatch) -> Result<PresenceRecord> {
        self.request(|reply| RoomCommand::Update {
            viewer_id,
            patch,
            reply,
        })
        .await?
    }

    /// Remove a record. Unknown viewers are a no-op returning `false`.
    pub async fn untrack(&self, viewer_id: ViewerId) -> Result<bool> {
        self.request(|reply| RoomCommand::Untrack { viewer_id, reply })
            .await
    }

    /// Current membership.
    pub async fn list(&self) -> Result<RoomSnapshot> {
        self.request(|reply| RoomCommand::List { reply }).await
    }

    /// Resolve numbering and color, track, and subscribe in one step. The
    /// record is owned by the session holding `owner`.
    pub async fn join(&self, identity: ResolvedIdentity, owner: SessionToken) -> Result<Joined> {
        self.request(|reply| RoomCommand::Join {
            identity,
            owner,
            reply,
        })
        .await?
    }

    /// Track a record carried over from a previous coordinator, with a
    /// snapshot and subscription taken in the same step.
    ///
    /// `AlreadyTracked` means the id belongs to a different session.
    pub async fn reannounce(
        &self,
        viewer_id: ViewerId,
        metadata: TrackMetadata,
        owner: SessionToken,
    ) -> Result<(RoomSnapshot, DiffSubscription)> {
        self.request(|reply| RoomCommand::Reannounce {
            viewer_id,
            metadata,
            owner,
            reply,
        })
        .await?
    }

    /// Fresh snapshot plus a subscription starting right after it.
    pub async fn resync(&self) -> Result<(RoomSnapshot, DiffSubscription)> {
        self.request(|reply| RoomCommand::Resync { reply }).await
    }

    /// Extend a record's lease. Never blocks; a full queue skips this round.
    pub fn renew_lease(&self, viewer_id: ViewerId) {
        if let Err(e) = self.inner.tx.try_send(RoomCommand::RenewLease { viewer_id }) {
            debug!(room_id = %self.inner.room_id, error = %e, "lease renewal skipped");
        }
    }

    /// Stop the coordinator. Its records are discarded and subscriptions close.
    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(RoomCommand::Shutdown).await;
    }

    /// Whether the coordinator task has exited.
    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    /// Live record count as of the last mutation.
    pub fn member_count(&self) -> usize {
        self.inner.shared.members.load(Ordering::Acquire)
    }

    /// Last anonymous number handed out, or zero after the room drained.
    pub fn anonymous_counter(&self) -> u64 {
        self.inner.shared.counter.load(Ordering::Acquire)
    }

    /// Handles sharing this coordinator (including this one).
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn room() -> RoomHandle {
        RoomHandle::spawn(RoomId::from("doc-1"), &config())
    }

    fn meta(name: &str) -> TrackMetadata {
        TrackMetadata::new(name, "#4363d8")
    }

    async fn join_anonymous(room: &RoomHandle) -> Joined {
        room.join(ResolvedIdentity::Anonymous, SessionToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn track_then_list() {
        let room = room();
        let r = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        assert_eq!(r.seq, 1);
        let snap = room.list().await.unwrap();
        assert_eq!(snap.seq, 1);
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.records[0].display_name, "A");
        assert_eq!(room.member_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_track_rejected() {
        let room = room();
        let _ = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        let err = room.track(ViewerId::from("a"), meta("A2")).await.unwrap_err();
        assert_matches!(err, PresenceError::AlreadyTracked { .. });
        assert_eq!(room.list().await.unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_viewer_not_found() {
        let room = room();
        let err = room
            .update(ViewerId::from("ghost"), PresencePatch::cursor(Position::new(1, 1)))
            .await
            .unwrap_err();
        assert_matches!(err, PresenceError::NotFound { .. });
    }

    #[tokio::test]
    async fn update_merges_and_emits_replace() {
        let room = room();
        let (_, mut sub) = room.resync().await.unwrap();
        let _ = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        let _ = room
            .update(
                ViewerId::from("a"),
                PresencePatch::selection(Selection::new(Position::new(0, 0), Position::new(0, 3))),
            )
            .await
            .unwrap();
        let rec = room
            .update(ViewerId::from("a"), PresencePatch::cursor(Position::new(5, 10)))
            .await
            .unwrap();
        assert_eq!(rec.cursor, Some(Position::new(5, 10)));
        assert!(rec.selection.is_some());

        let join = sub.recv().await.unwrap();
        assert_eq!(join.seq, 1);
        let _ = sub.recv().await.unwrap();
        let update = sub.recv().await.unwrap();
        assert_eq!(update.seq, 3);
        assert!(update.diff.leaves.contains_key(&ViewerId::from("a")));
        assert_eq!(
            update.diff.joins[&ViewerId::from("a")].cursor,
            Some(Position::new(5, 10))
        );
    }

    #[tokio::test]
    async fn noop_update_emits_nothing() {
        let room = room();
        let _ = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        let _ = room
            .update(ViewerId::from("a"), PresencePatch::clear_selection())
            .await
            .unwrap();
        assert_eq!(room.list().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn untrack_is_idempotent() {
        let room = room();
        let _ = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        assert!(room.untrack(ViewerId::from("a")).await.unwrap());
        assert!(!room.untrack(ViewerId::from("a")).await.unwrap());
        let snap = room.list().await.unwrap();
        assert!(snap.records.is_empty());
        // Only the real removal produced a diff.
        assert_eq!(snap.seq, 2);
    }

    #[tokio::test]
    async fn anonymous_numbers_follow_join_order() {
        let room = room();
        for n in 1..=3 {
            let joined = join_anonymous(&room).await;
            assert_eq!(joined.record.display_name, format!("Anonymous User {n}"));
            assert_eq!(joined.record.anonymous_number, Some(n));
        }
    }

    #[tokio::test]
    async fn anonymous_number_not_reused_while_room_occupied() {
        let room = room();
        let first = join_anonymous(&room).await;
        let _second = join_anonymous(&room).await;
        assert!(room.untrack(first.record.viewer_id).await.unwrap());
        let third = join_anonymous(&room).await;
        assert_eq!(third.record.display_name, "Anonymous User 3");
    }

    #[tokio::test]
    async fn anonymous_counter_resets_when_room_drains() {
        let room = room();
        let a = join_anonymous(&room).await;
        let b = join_anonymous(&room).await;
        let _ = room.untrack(a.record.viewer_id).await.unwrap();
        let _ = room.untrack(b.record.viewer_id).await.unwrap();
        let c = join_anonymous(&room).await;
        assert_eq!(c.record.display_name, "Anonymous User 1");
    }

    #[tokio::test]
    async fn join_snapshot_excludes_self_and_subscription_starts_with_own_join() {
        let room = room();
        let a = join_anonymous(&room).await;
        assert!(a.snapshot.records.is_empty());

        let mut b = room
            .join(
                ResolvedIdentity::Authenticated {
                    stable_id: ViewerId::from("u-7"),
                    display_label: "Bea".into(),
                },
                SessionToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(b.snapshot.records.len(), 1);
        assert_eq!(b.record.display_name, "Bea");

        let own = b.subscription.recv().await.unwrap();
        assert_eq!(own.seq, b.snapshot.seq + 1);
        assert!(own.diff.joins.contains_key(&ViewerId::from("u-7")));
    }

    #[tokio::test]
    async fn authenticated_duplicate_join_rejected() {
        let room = room();
        let ident = ResolvedIdentity::Authenticated {
            stable_id: ViewerId::from("u-7"),
            display_label: "Bea".into(),
        };
        let _ = room.join(ident.clone(), SessionToken::new()).await.unwrap();
        assert_matches!(
            room.join(ident, SessionToken::new()).await,
            Err(PresenceError::AlreadyTracked { .. })
        );
    }

    #[tokio::test]
    async fn restored_anonymous_number_advances_counter() {
        let room = room();
        let mut m = meta("Anonymous User 4");
        m.anonymous_number = Some(4);
        let _ = room.track(ViewerId::anonymous(4), m).await.unwrap();
        let next = join_anonymous(&room).await;
        assert_eq!(next.record.anonymous_number, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn unrenewed_lease_is_swept() {
        let room = room();
        let (_, mut sub) = room.resync().await.unwrap();
        let _ = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        let _ = sub.recv().await.unwrap();

        tokio::time::sleep(config().lease_ttl + config().sweep_interval * 2).await;

        let leave = sub.recv().await.unwrap();
        assert!(leave.diff.leaves.contains_key(&ViewerId::from("a")));
        assert!(room.list().await.unwrap().records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_survives_sweeps() {
        let room = room();
        let _ = room.track(ViewerId::from("a"), meta("A")).await.unwrap();
        for _ in 0..6 {
            tokio::time::sleep(config().lease_renew_interval).await;
            room.renew_lease(ViewerId::from("a"));
        }
        assert_eq!(room.list().await.unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_room_and_subscriptions() {
        let room = room();
        let (_, mut sub) = room.resync().await.unwrap();
        room.shutdown().await;
        assert_matches!(sub.recv().await, Err(PresenceError::RoomUnavailable(_)));
        assert!(room.is_closed());
        assert_matches!(room.list().await, Err(PresenceError::RoomUnavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_joins_get_distinct_numbers() {
        let room = room();
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let room = room.clone();
            tasks.push(tokio::spawn(async move {
                join_anonymous(&room)
                    .await
                    .record
                    .anonymous_number
                    .unwrap()
            }));
        }
        let mut numbers = Vec::new();
        for t in tasks {
            numbers.push(t.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn reannounce_over_foreign_record_rejected() {
        let room = room();
        let joined = join_anonymous(&room).await;
        let metadata = TrackMetadata::from(&joined.record);
        assert_matches!(
            room.reannounce(joined.record.viewer_id.clone(), metadata, SessionToken::new())
                .await,
            Err(PresenceError::AlreadyTracked { .. })
        );
        let snap = room.list().await.unwrap();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.seq, 1);
    }

    #[tokio::test]
    async fn reannounce_by_owner_keeps_record_without_diff() {
        let room = room();
        let owner = SessionToken::new();
        let joined = room
            .join(ResolvedIdentity::Anonymous, owner.clone())
            .await
            .unwrap();
        let metadata = TrackMetadata::from(&joined.record);
        let (snapshot, _sub) = room
            .reannounce(joined.record.viewer_id.clone(), metadata, owner)
            .await
            .unwrap();
        assert_eq!(snapshot.seq, 1);
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].viewer_id, joined.record.viewer_id);
    }

    #[tokio::test]
    async fn respawned_coordinator_continues_anonymous_numbering() {
        let old = room();
        let _ = join_anonymous(&old).await;
        let second = join_anonymous(&old).await;
        assert_eq!(old.anonymous_counter(), 2);
        old.shutdown().await;

        let fresh = old.respawn(&config());
        // A newcomer arrives before the survivors re-announce.
        let newcomer = join_anonymous(&fresh).await;
        assert_eq!(newcomer.record.anonymous_number, Some(3));

        let metadata = TrackMetadata::from(&second.record);
        let _ = fresh
            .reannounce(second.record.viewer_id.clone(), metadata, SessionToken::new())
            .await
            .unwrap();
        let names: Vec<_> = fresh
            .list()
            .await
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
    }
}
