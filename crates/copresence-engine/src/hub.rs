//! Entry point that ties identity, rooms, and sessions together.

use std::sync::Arc;
use std::time::Duration;

use copresence_core::{PresenceError, Result, RoomId, ServerEvent, SessionToken, ViewerId};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::directory::RoomDirectory;
use crate::identity::{AnonymousResolver, CallerContext, IdentityResolver, ResolvedIdentity};
use crate::room::RoomSnapshot;
use crate::session::{SessionHandle, SessionSpawn, spawn_session};

/// How long `shutdown` waits for sessions to leave their rooms.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Owns every room and session on this node.
pub struct PresenceHub {
    config: EngineConfig,
    directory: Arc<RoomDirectory>,
    resolver: Arc<dyn IdentityResolver>,
    sessions: Arc<DashMap<SessionToken, SessionHandle>>,
    cancel: CancellationToken,
}

impl PresenceHub {
    /// Hub resolving callers through `resolver`.
    pub fn new(config: EngineConfig, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            directory: Arc::new(RoomDirectory::new(config.clone())),
            config,
            resolver,
            sessions: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Hub that treats every caller as anonymous.
    pub fn anonymous(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(AnonymousResolver))
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Room directory.
    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// Attach a transport to `room_id`.
    ///
    /// A live resume token for the same room reattaches that session. An
    /// authenticated viewer already present in the room takes over its
    /// session. Anyone else joins fresh. The first event on `outbound` is
    /// always an initial snapshot.
    #[instrument(skip_all, fields(%room_id, remote = ?ctx.remote_addr))]
    pub async fn connect(
        &self,
        room_id: &RoomId,
        ctx: &CallerContext,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<SessionHandle> {
        if self.cancel.is_cancelled() {
            return Err(PresenceError::RoomUnavailable(room_id.clone()));
        }

        if let Some(token) = &ctx.resume_token {
            if let Some(session) = self.session(token).filter(|s| s.room_id() == room_id) {
                match session.resume(outbound.clone()).await {
                    Ok(()) => return Ok(session),
                    Err(e) => debug!(error = %e, "resume target ended, joining fresh"),
                }
            } else {
                debug!(%token, "unknown resume token, joining fresh");
            }
        }

        let identity = self.resolver.resolve_identity(ctx).await;
        if let Some(session) = self.takeover(room_id, &identity, &outbound).await {
            return Ok(session);
        }

        let token = SessionToken::new();
        let mut retried = false;
        loop {
            let room = self.directory.room(room_id);
            match room.join(identity.clone(), token.clone()).await {
                Ok(joined) => {
                    let session = spawn_session(SessionSpawn {
                        token,
                        room,
                        joined,
                        outbound,
                        directory: self.directory.clone(),
                        sessions: self.sessions.clone(),
                        config: self.config.clone(),
                        cancel: self.cancel.child_token(),
                    });
                    info!(viewer_id = %session.viewer_id(), "viewer joined");
                    return Ok(session);
                }
                Err(PresenceError::RoomUnavailable(_)) if !retried => {
                    warn!("room coordinator unavailable, retrying join");
                }
                Err(PresenceError::AlreadyTracked { .. }) if !retried => {
                    if let Some(session) = self.takeover(room_id, &identity, &outbound).await {
                        return Ok(session);
                    }
                }
                Err(e) => return Err(e),
            }
            retried = true;
        }
    }

    async fn takeover(
        &self,
        room_id: &RoomId,
        identity: &ResolvedIdentity,
        outbound: &mpsc::Sender<ServerEvent>,
    ) -> Option<SessionHandle> {
        let ResolvedIdentity::Authenticated { stable_id, .. } = identity else {
            return None;
        };
        let session = self.find_session(room_id, stable_id)?;
        match session.resume(outbound.clone()).await {
            Ok(()) => {
                info!(viewer_id = %stable_id, "existing session taken over");
                Some(session)
            }
            Err(e) => {
                debug!(error = %e, "takeover target ended");
                None
            }
        }
    }

    /// Live session for `token`.
    pub fn session(&self, token: &SessionToken) -> Option<SessionHandle> {
        self.sessions
            .get(token)
            .map(|s| s.value().clone())
            .filter(|s| !s.is_removed())
    }

    /// Live session of `viewer_id` in `room_id`.
    pub fn find_session(&self, room_id: &RoomId, viewer_id: &ViewerId) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|s| s.room_id() == room_id && s.viewer_id() == viewer_id && !s.is_removed())
            .map(|s| s.value().clone())
    }

    /// Sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Rooms currently running.
    pub fn room_count(&self) -> usize {
        self.directory.room_count()
    }

    /// Membership of `room_id`. A room nobody has opened is empty.
    pub async fn list(&self, room_id: &RoomId) -> Result<RoomSnapshot> {
        match self.directory.get(room_id) {
            Some(room) => room.list().await,
            None => Ok(RoomSnapshot {
                seq: 0,
                records: Vec::new(),
            }),
        }
    }

    /// Periodically stop rooms that are empty and unreferenced.
    pub fn spawn_janitor(&self, every: Duration) -> JoinHandle<()> {
        let directory = self.directory.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(every) => {
                        let pruned = directory.prune().await;
                        if pruned > 0 {
                            debug!(pruned, "idle rooms pruned");
                        }
                    }
                }
            }
        })
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// End every session, then stop every room.
    pub async fn shutdown(&self) {
        info!(sessions = self.sessions.len(), "presence hub shutting down");
        self.cancel.cancel();
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|s| s.value().clone()).collect();
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            for handle in &handles {
                handle.wait_removed().await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("sessions did not drain before shutdown deadline");
        }
        self.directory.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticTokenResolver;
    use assert_matches::assert_matches;

    fn outbound() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn connect_sends_snapshot_first() {
        let hub = PresenceHub::anonymous(EngineConfig::default());
        let (tx, mut rx) = outbound();
        let session = hub
            .connect(&RoomId::from("doc-1"), &CallerContext::anonymous(), tx)
            .await
            .unwrap();
        assert_matches!(rx.recv().await, Some(ServerEvent::InitialSnapshot(s)) if s.records.is_empty());
        assert_matches!(rx.recv().await, Some(ServerEvent::PresenceDiff(e)) if e.diff.joins.contains_key(session.viewer_id()));
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn unknown_resume_token_joins_fresh() {
        let hub = PresenceHub::anonymous(EngineConfig::default());
        let (tx, _rx) = outbound();
        let ctx = CallerContext::anonymous().resuming(SessionToken::from("stale"));
        let session = hub.connect(&RoomId::from("doc-1"), &ctx, tx).await.unwrap();
        assert_eq!(session.display_name(), "Anonymous User 1");
    }

    #[tokio::test]
    async fn same_account_takes_over_session() {
        let resolver = StaticTokenResolver::new().with_token("k", "u-1", "Ada");
        let hub = PresenceHub::new(EngineConfig::default(), Arc::new(resolver));
        let room = RoomId::from("doc-1");

        let (tx1, mut rx1) = outbound();
        let first = hub.connect(&room, &CallerContext::with_bearer("k"), tx1).await.unwrap();
        let (tx2, mut rx2) = outbound();
        let second = hub.connect(&room, &CallerContext::with_bearer("k"), tx2).await.unwrap();

        assert_eq!(first.token(), second.token());
        assert_eq!(hub.list(&room).await.unwrap().records.len(), 1);
        assert_matches!(rx2.recv().await, Some(ServerEvent::InitialSnapshot(s)) if s.records.len() == 1);
        // Old transport's channel is dropped by the session.
        while rx1.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn list_of_unopened_room_is_empty() {
        let hub = PresenceHub::anonymous(EngineConfig::default());
        let snap = hub.list(&RoomId::from("nobody")).await.unwrap();
        assert!(snap.records.is_empty());
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_removes_sessions_and_rejects_connects() {
        let hub = PresenceHub::anonymous(EngineConfig::default());
        let (tx, _rx) = outbound();
        let session = hub
            .connect(&RoomId::from("doc-1"), &CallerContext::anonymous(), tx)
            .await
            .unwrap();
        hub.shutdown().await;
        session.wait_removed().await;
        assert_eq!(hub.room_count(), 0);

        let (tx, _rx) = outbound();
        assert_matches!(
            hub.connect(&RoomId::from("doc-1"), &CallerContext::anonymous(), tx).await,
            Err(PresenceError::RoomUnavailable(_))
        );
    }
}
