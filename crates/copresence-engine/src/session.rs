//! Per-connection session actor.
//!
//! One task per viewer connection. It owns the viewer's throttle, grace
//! timer, lease ticker, and diff subscription, and is the only thing that
//! writes the viewer's record. The transport talks to it through a
//! [`SessionHandle`].
//!
//! Lifecycle:
//!
//! ```text
//! Joining -> Active <-> Disconnected
//!               \           |
//!                `-> Removed <'
//! ```
//!
//! The transport signals loss by dropping its end of the outbound channel
//! (or by calling [`SessionHandle::transport_lost`]). A transport that went
//! quiet reports it with [`SessionHandle::transport_silent`], naming its
//! channel and how long ago it last heard from the client. Because loss is
//! tied to that channel, a transport that was already replaced by a
//! takeover cannot knock out its successor.
//!
//! `Disconnected` keeps the record (marked reconnecting) for the grace
//! window, counted from the last sign of life. A resume inside the window
//! returns to `Active` with the record untouched; otherwise the record is
//! untracked and the session ends.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use copresence_core::{
    ClientCommand, ConnectionState, PresenceError, PresenceEvent, PresencePatch, PresenceRecord,
    Position, Result, RoomId, Selection, ServerEvent, SessionToken, Snapshot, ViewerId,
};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::broadcaster::DiffSubscription;
use crate::config::EngineConfig;
use crate::directory::RoomDirectory;
use crate::room::{Joined, RoomHandle, RoomSnapshot, TrackMetadata};
use crate::supervisor::{GraceTimer, lease_ticker};
use crate::throttle::Throttle;

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Record being created.
    Joining,
    /// Transport attached, updates flowing.
    Active,
    /// Transport gone, grace window running.
    Disconnected,
    /// Record untracked. Terminal.
    Removed,
}

impl SessionState {
    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Active, Disconnected, Joining, Removed};
        matches!(
            (self, next),
            (Joining, Active | Removed) | (Active, Disconnected | Removed) | (Disconnected, Active | Removed)
        )
    }

    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Removed
    }
}

pub(crate) enum SessionCommand {
    Input(ClientCommand),
    TransportLost,
    TransportSilent {
        transport: mpsc::WeakSender<ServerEvent>,
        silent_for: Duration,
        reply: oneshot::Sender<bool>,
    },
    Disconnect,
    Resume {
        outbound: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    token: SessionToken,
    room_id: RoomId,
    viewer_id: ViewerId,
    display_name: String,
    tx: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("token", &self.token)
            .field("room_id", &self.room_id)
            .field("viewer_id", &self.viewer_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Token the client presents to resume.
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Room the session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Viewer this session speaks for.
    pub fn viewer_id(&self) -> &ViewerId {
        &self.viewer_id
    }

    /// Label assigned at join.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session has ended.
    pub fn is_removed(&self) -> bool {
        self.state().is_terminal() || self.tx.is_closed()
    }

    fn closed(&self) -> PresenceError {
        PresenceError::SessionClosed(self.token.clone())
    }

    async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| self.closed())
    }

    /// Queue a decoded client command.
    pub async fn submit(&self, cmd: ClientCommand) -> Result<()> {
        self.send(SessionCommand::Input(cmd)).await
    }

    /// Decode and queue a raw text frame. Malformed frames are dropped.
    pub async fn submit_raw(&self, text: &str) -> Result<()> {
        match ClientCommand::parse(text) {
            Ok(cmd) => self.submit(cmd).await,
            Err(e) => {
                debug!(token = %self.token, error = %e, "dropping malformed frame");
                Ok(())
            }
        }
    }

    /// Move the cursor.
    pub async fn cursor_moved(&self, line: u32, column: u32) -> Result<()> {
        self.submit(ClientCommand::CursorMoved { line, column }).await
    }

    /// Select a range.
    pub async fn text_selected(&self, start: Position, end: Position) -> Result<()> {
        self.submit(ClientCommand::TextSelected { start, end }).await
    }

    /// Clear the selection.
    pub async fn selection_cleared(&self) -> Result<()> {
        self.submit(ClientCommand::SelectionCleared).await
    }

    /// Client liveness ping.
    pub async fn heartbeat(&self) -> Result<()> {
        self.submit(ClientCommand::Heartbeat).await
    }

    /// The transport dropped without a goodbye. Starts the grace window.
    pub async fn transport_lost(&self) {
        if self.send(SessionCommand::TransportLost).await.is_err() {
            trace!(token = %self.token, "transport lost after session ended");
        }
    }

    /// The client behind `transport` has not been heard from for
    /// `silent_for`. Starts the grace window as if the loss had happened
    /// that long ago.
    ///
    /// Returns `false` when `transport` is no longer this session's
    /// transport (a resume or takeover replaced it) or the session is not
    /// active; nothing changes in that case.
    pub async fn transport_silent(
        &self,
        transport: &mpsc::WeakSender<ServerEvent>,
        silent_for: Duration,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = SessionCommand::TransportSilent {
            transport: transport.clone(),
            silent_for,
            reply,
        };
        if self.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Leave now, skipping the grace window.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(SessionCommand::Disconnect).await
    }

    /// Attach a new outbound channel. Works from `Disconnected` (reconnect)
    /// and from `Active` (the old transport is dropped).
    pub async fn resume(&self, outbound: mpsc::Sender<ServerEvent>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Resume { outbound, reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Resolves once the session reaches `Removed`.
    pub async fn wait_removed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

/// Everything a new session needs.
pub(crate) struct SessionSpawn {
    pub token: SessionToken,
    pub room: RoomHandle,
    pub joined: Joined,
    pub outbound: mpsc::Sender<ServerEvent>,
    pub directory: Arc<RoomDirectory>,
    pub sessions: Arc<DashMap<SessionToken, SessionHandle>>,
    pub config: EngineConfig,
    pub cancel: CancellationToken,
}

/// Register and start a session. The initial snapshot is queued on
/// `outbound` before this returns.
pub(crate) fn spawn_session(params: SessionSpawn) -> SessionHandle {
    let SessionSpawn {
        token,
        room,
        joined,
        outbound,
        directory,
        sessions,
        config,
        cancel,
    } = params;
    let Joined {
        record,
        snapshot,
        subscription,
    } = joined;

    let (tx, rx) = mpsc::channel(config.session_queue_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(SessionState::Joining);
    let handle = SessionHandle {
        token: token.clone(),
        room_id: room.room_id().clone(),
        viewer_id: record.viewer_id.clone(),
        display_name: record.display_name.clone(),
        tx,
        state: state_rx,
    };

    let mut actor = SessionActor {
        token: token.clone(),
        room_id: room.room_id().clone(),
        viewer_id: record.viewer_id.clone(),
        throttle: Throttle::new(config.throttle_interval),
        lease: lease_ticker(config.lease_renew_interval),
        grace: GraceTimer::new(),
        record,
        room,
        directory,
        subscription: Some(subscription),
        outbound: Some(outbound),
        last_seq: 0,
        needs_resync: false,
        transport_closed: false,
        state: state_tx,
        sessions: sessions.clone(),
        config,
        cancel,
    };
    actor.send_snapshot(snapshot);
    actor.set_state(SessionState::Active);

    let _ = sessions.insert(token, handle.clone());
    drop(tokio::spawn(actor.run(rx)));
    handle
}

struct SessionActor {
    token: SessionToken,
    room_id: RoomId,
    viewer_id: ViewerId,
    /// Last known copy of this viewer's record, used to re-announce.
    record: PresenceRecord,
    room: RoomHandle,
    directory: Arc<RoomDirectory>,
    subscription: Option<DiffSubscription>,
    outbound: Option<mpsc::Sender<ServerEvent>>,
    last_seq: u64,
    throttle: Throttle,
    grace: GraceTimer,
    lease: Interval,
    needs_resync: bool,
    transport_closed: bool,
    state: watch::Sender<SessionState>,
    sessions: Arc<DashMap<SessionToken, SessionHandle>>,
    config: EngineConfig,
    cancel: CancellationToken,
}

async fn next_diff(
    subscription: &mut Option<DiffSubscription>,
) -> Result<Arc<PresenceEvent>> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => future::pending().await,
    }
}

/// Resolves when the transport drops its receiving half.
async fn outbound_closed(outbound: &Option<mpsc::Sender<ServerEvent>>) {
    match outbound {
        Some(tx) => tx.closed().await,
        None => future::pending().await,
    }
}

impl SessionActor {
    #[instrument(skip_all, fields(room_id = %self.room_id, viewer_id = %self.viewer_id))]
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        info!(token = %self.token, "session started");
        loop {
            if self.transport_closed {
                self.transport_closed = false;
                self.on_transport_lost(Duration::ZERO).await;
            }
            if self.current_state().is_terminal() {
                break;
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.leave("shutdown").await;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => self.leave("all handles dropped").await,
                },
                event = next_diff(&mut self.subscription) => self.on_event(event).await,
                () = outbound_closed(&self.outbound) => {
                    debug!("transport receiver dropped");
                    self.on_transport_lost(Duration::ZERO).await;
                }
                _ = self.lease.tick() => {
                    self.room.renew_lease(self.viewer_id.clone());
                    if self.needs_resync {
                        self.resync().await;
                    }
                }
                () = self.grace.expired() => {
                    let _ = self.grace.cancel();
                    self.leave("grace window expired").await;
                }
            }
        }
        let _ = self.sessions.remove(&self.token);
        info!(token = %self.token, "session ended");
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let current = self.current_state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(?current, ?next, "ignoring illegal session transition");
            return;
        }
        debug!(?current, ?next, "session transition");
        let _ = self.state.send_replace(next);
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Input(input) => self.on_input(input).await,
            SessionCommand::TransportLost => self.on_transport_lost(Duration::ZERO).await,
            SessionCommand::TransportSilent {
                transport,
                silent_for,
                reply,
            } => {
                let current = self.current_state() == SessionState::Active
                    && matches!(
                        (&self.outbound, transport.upgrade()),
                        (Some(ours), Some(reported)) if ours.same_channel(&reported)
                    );
                if current {
                    self.on_transport_lost(silent_for).await;
                } else {
                    debug!("silence reported by a replaced transport, ignored");
                }
                let _ = reply.send(current);
            }
            SessionCommand::Disconnect => self.leave("client disconnect").await,
            SessionCommand::Resume { outbound, reply } => {
                let result = self.on_resume(outbound).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn on_input(&mut self, input: ClientCommand) {
        let patch = match input {
            ClientCommand::CursorMoved { line, column } => {
                PresencePatch::cursor(Position::new(line, column))
            }
            ClientCommand::TextSelected { start, end } => {
                PresencePatch::selection(Selection::new(start, end))
            }
            ClientCommand::SelectionCleared => PresencePatch::clear_selection(),
            ClientCommand::Heartbeat => {
                self.room.renew_lease(self.viewer_id.clone());
                if self.needs_resync {
                    self.resync().await;
                }
                return;
            }
            ClientCommand::Disconnect => {
                self.leave("client disconnect").await;
                return;
            }
        };
        if self.current_state() != SessionState::Active {
            debug!("update while not active, dropped");
            return;
        }
        if !self.throttle.admit(Instant::now()) {
            trace!(discarded = self.throttle.discarded(), "update throttled");
            return;
        }
        self.apply_patch(patch).await;
    }

    async fn apply_patch(&mut self, patch: PresencePatch) {
        match self.room.update(self.viewer_id.clone(), patch).await {
            Ok(record) => self.record = record,
            Err(e) if e.needs_reannounce() => {
                warn!(error = %e, "record missing from room, re-announcing");
                let _ = self.record.apply_patch(&patch, Utc::now());
                self.reannounce().await;
            }
            Err(e) => warn!(error = %e, "presence update failed"),
        }
    }

    async fn on_event(&mut self, event: Result<Arc<PresenceEvent>>) {
        match event {
            Ok(event) => {
                if event.seq <= self.last_seq || self.needs_resync {
                    return;
                }
                self.last_seq = event.seq;
                let rejoined = event.diff.joins.get(&self.viewer_id);
                let swept = rejoined.is_none() && event.diff.leaves.contains_key(&self.viewer_id);
                if let Some(record) = rejoined {
                    self.record = record.clone();
                }
                self.deliver(ServerEvent::PresenceDiff(PresenceEvent::clone(&event)));
                if swept {
                    warn!("record removed by the room, re-announcing");
                    self.reannounce().await;
                }
            }
            Err(PresenceError::DeliveryGap { skipped }) => {
                warn!(skipped, "subscription lagged, resyncing");
                self.resync().await;
            }
            Err(e) => {
                warn!(error = %e, "room subscription closed, re-announcing");
                self.subscription = None;
                self.reannounce().await;
            }
        }
    }

    /// Queue an event for the transport without waiting.
    fn deliver(&mut self, event: ServerEvent) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        match outbound.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.needs_resync {
                    warn!("outbound queue full, resync on next heartbeat or lease tick");
                }
                self.needs_resync = true;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("outbound channel closed");
                self.outbound = None;
                self.transport_closed = true;
            }
        }
    }

    fn send_snapshot(&mut self, snapshot: RoomSnapshot) {
        self.last_seq = snapshot.seq;
        self.deliver(ServerEvent::InitialSnapshot(Snapshot {
            room_id: self.room_id.clone(),
            viewer_id: self.viewer_id.clone(),
            resume_token: self.token.clone(),
            seq: snapshot.seq,
            records: snapshot.records,
        }));
    }

    fn install(&mut self, snapshot: RoomSnapshot, subscription: DiffSubscription) {
        if self.outbound.is_none() {
            return;
        }
        self.subscription = Some(subscription);
        self.needs_resync = false;
        self.send_snapshot(snapshot);
    }

    async fn resync(&mut self) {
        match self.room.resync().await {
            Ok((snapshot, subscription)) => {
                debug!(seq = snapshot.seq, "resynced");
                self.install(snapshot, subscription);
            }
            Err(e) if e.needs_reannounce() => self.reannounce().await,
            Err(e) => warn!(error = %e, "resync failed"),
        }
    }

    /// Put this viewer's record back into the room, restarting the
    /// coordinator if it is gone.
    async fn reannounce(&mut self) {
        let room = self.directory.room(&self.room_id);
        let metadata = TrackMetadata::from(&self.record);
        match room
            .reannounce(self.viewer_id.clone(), metadata, self.token.clone())
            .await
        {
            Ok((snapshot, subscription)) => {
                info!(seq = snapshot.seq, "re-announced into room");
                self.room = room;
                self.install(snapshot, subscription);
            }
            Err(PresenceError::AlreadyTracked { .. }) => {
                // Another session holds this id now. Its record is not ours
                // to untrack.
                warn!("viewer id claimed by another session");
                self.room = room;
                self.finish("identity claimed by another session");
            }
            Err(e) => warn!(error = %e, "re-announce failed"),
        }
    }

    /// `silent_for` is how long before detection the client was last heard
    /// from. It comes off the grace window.
    async fn on_transport_lost(&mut self, silent_for: Duration) {
        if self.current_state() != SessionState::Active {
            return;
        }
        self.outbound = None;
        self.subscription = None;
        self.needs_resync = false;
        self.set_state(SessionState::Disconnected);
        let window = self.config.grace_window.saturating_sub(silent_for);
        let _ = self.grace.arm(window);
        info!(
            grace_ms = window.as_millis(),
            silent_ms = silent_for.as_millis(),
            "transport lost, grace window started"
        );
        self.apply_patch(PresencePatch::connection_state(ConnectionState::Disconnected))
            .await;
    }

    async fn on_resume(&mut self, outbound: mpsc::Sender<ServerEvent>) -> Result<()> {
        let state = self.current_state();
        if state.is_terminal() {
            return Err(PresenceError::SessionClosed(self.token.clone()));
        }
        if state == SessionState::Active {
            info!("session taken over by a new transport");
        } else {
            info!("session resumed inside grace window");
        }
        let _ = self.grace.cancel();
        self.outbound = Some(outbound);
        self.transport_closed = false;
        self.set_state(SessionState::Active);
        if self.record.is_reconnecting() {
            self.apply_patch(PresencePatch::connection_state(ConnectionState::Active))
                .await;
        }
        self.resync().await;
        Ok(())
    }

    async fn leave(&mut self, reason: &str) {
        match self.room.untrack(self.viewer_id.clone()).await {
            Ok(removed) => debug!(removed, "viewer untracked"),
            Err(e) => debug!(error = %e, "untrack skipped"),
        }
        self.finish(reason);
    }

    fn finish(&mut self, reason: &str) {
        let _ = self.grace.cancel();
        self.subscription = None;
        self.outbound = None;
        self.set_state(SessionState::Removed);
        info!(reason, "session removed");
    }
}
