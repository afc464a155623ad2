//! End-to-end behavior of hub, sessions, and rooms under paused time.

use std::time::Duration;

use assert_matches::assert_matches;
use copresence_core::{ConnectionState, Position, PresenceView, RoomId, ServerEvent, ViewerId};
use copresence_engine::{CallerContext, EngineConfig, PresenceHub, SessionHandle, SessionState};
use tokio::sync::mpsc;

const SETTLE: Duration = Duration::from_millis(50);

/// A connected client: its session plus the view it builds from events.
struct Viewer {
    session: SessionHandle,
    rx: mpsc::Receiver<ServerEvent>,
    view: PresenceView,
    snapshots: usize,
}

impl Viewer {
    async fn connect(hub: &PresenceHub, room: &str) -> Self {
        Self::connect_with(hub, room, CallerContext::anonymous(), 64).await
    }

    async fn connect_with(hub: &PresenceHub, room: &str, ctx: CallerContext, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let session = hub.connect(&RoomId::from(room), &ctx, tx).await.unwrap();
        Self {
            session,
            rx,
            view: PresenceView::new(),
            snapshots: 0,
        }
    }

    fn apply(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::InitialSnapshot(s) => {
                self.snapshots += 1;
                self.view.reset(s.seq, s.records);
            }
            ServerEvent::PresenceDiff(e) => {
                let _ = self.view.apply(&e);
            }
        }
    }

    /// Apply everything that arrives until the stream goes quiet.
    async fn pump(&mut self) {
        while let Ok(Some(event)) = tokio::time::timeout(SETTLE, self.rx.recv()).await {
            self.apply(event);
        }
    }

    fn id(&self) -> ViewerId {
        self.session.viewer_id().clone()
    }

    fn cursor_of(&self, other: &ViewerId) -> Option<Position> {
        self.view.get(other).and_then(|r| r.cursor)
    }
}

fn hub() -> PresenceHub {
    PresenceHub::anonymous(EngineConfig::default())
}

#[tokio::test(start_paused = true)]
async fn two_viewers_see_each_other_and_abrupt_drop_is_removed_after_grace() {
    let hub = hub();

    let mut a = Viewer::connect(&hub, "doc-1").await;
    assert_matches!(a.rx.recv().await, Some(ServerEvent::InitialSnapshot(s)) if s.records.is_empty());
    a.pump().await;
    assert_eq!(a.view.len(), 1);

    let mut b = Viewer::connect(&hub, "doc-1").await;
    a.pump().await;
    b.pump().await;
    assert_eq!(a.view.len(), 2);
    assert_eq!(b.view.len(), 2);

    a.session.cursor_moved(5, 10).await.unwrap();
    b.pump().await;
    assert_eq!(b.cursor_of(&a.id()), Some(Position::new(5, 10)));

    b.session.transport_lost().await;
    drop(b.rx);
    a.pump().await;
    let b_record = a.view.get(b.session.viewer_id()).cloned().unwrap();
    assert!(b_record.is_reconnecting());

    tokio::time::sleep(hub.config().grace_window).await;
    a.pump().await;
    assert_eq!(a.view.len(), 1);
    assert!(a.view.get(b.session.viewer_id()).is_none());
    assert_eq!(b.session.state(), SessionState::Removed);
}

#[tokio::test(start_paused = true)]
async fn anonymous_numbers_not_reused_while_room_occupied() {
    let hub = hub();
    let one = Viewer::connect(&hub, "doc-2").await;
    let two = Viewer::connect(&hub, "doc-2").await;
    assert_eq!(one.session.display_name(), "Anonymous User 1");
    assert_eq!(two.session.display_name(), "Anonymous User 2");

    one.session.disconnect().await.unwrap();
    one.session.wait_removed().await;

    let three = Viewer::connect(&hub, "doc-2").await;
    assert_eq!(three.session.display_name(), "Anonymous User 3");
    assert_eq!(hub.list(&RoomId::from("doc-2")).await.unwrap().records.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn burst_inside_throttle_window_is_discarded() {
    let hub = hub();
    let a = Viewer::connect(&hub, "doc-1").await;
    let mut b = Viewer::connect(&hub, "doc-1").await;
    b.pump().await;

    a.session.cursor_moved(1, 1).await.unwrap();
    a.session.cursor_moved(1, 5).await.unwrap();
    b.pump().await;
    assert_eq!(b.cursor_of(&a.id()), Some(Position::new(1, 1)));

    tokio::time::sleep(hub.config().throttle_interval + Duration::from_millis(10)).await;
    a.session.cursor_moved(2, 3).await.unwrap();
    b.pump().await;
    assert_eq!(b.cursor_of(&a.id()), Some(Position::new(2, 3)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_inside_grace_keeps_identity_and_cursor() {
    let hub = hub();
    let a = Viewer::connect(&hub, "doc-1").await;
    let mut b = Viewer::connect(&hub, "doc-1").await;
    a.session.cursor_moved(3, 4).await.unwrap();
    b.pump().await;

    let token = a.session.token().clone();
    a.session.transport_lost().await;
    b.pump().await;
    assert_eq!(
        b.view.get(&a.id()).map(|r| r.connection_state),
        Some(ConnectionState::Disconnected)
    );

    tokio::time::sleep(hub.config().grace_window / 2).await;
    let mut again = Viewer::connect_with(&hub, "doc-1", CallerContext::anonymous().resuming(token.clone()), 64).await;
    again.pump().await;

    assert_eq!(again.session.token(), &token);
    assert_eq!(again.id(), a.id());
    assert_eq!(again.session.display_name(), "Anonymous User 1");
    assert_eq!(again.cursor_of(&a.id()), Some(Position::new(3, 4)));
    assert_eq!(again.view.len(), 2);

    b.pump().await;
    let seen = b.view.get(&a.id()).unwrap();
    assert_eq!(seen.connection_state, ConnectionState::Active);
    assert_eq!(seen.cursor, Some(Position::new(3, 4)));

    // The grace timer was cancelled: nothing is removed later.
    tokio::time::sleep(hub.config().grace_window * 2).await;
    b.pump().await;
    assert_eq!(b.view.len(), 2);
    drop(a);
}

#[tokio::test(start_paused = true)]
async fn resume_after_grace_joins_fresh() {
    let hub = hub();
    let a = Viewer::connect(&hub, "doc-1").await;
    let _b = Viewer::connect(&hub, "doc-1").await;
    let token = a.session.token().clone();

    a.session.transport_lost().await;
    a.session.wait_removed().await;

    let again = Viewer::connect_with(&hub, "doc-1", CallerContext::anonymous().resuming(token.clone()), 64).await;
    assert_ne!(again.session.token(), &token);
    assert_eq!(again.session.display_name(), "Anonymous User 3");
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_skips_grace() {
    let hub = hub();
    let a = Viewer::connect(&hub, "doc-1").await;
    let mut b = Viewer::connect(&hub, "doc-1").await;
    b.pump().await;
    assert_eq!(b.view.len(), 2);

    a.session.submit_raw(r#"{"type":"disconnect"}"#).await.unwrap();
    a.session.wait_removed().await;
    b.pump().await;
    assert_eq!(b.view.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped() {
    let hub = hub();
    let a = Viewer::connect(&hub, "doc-1").await;
    a.session.submit_raw("{not json").await.unwrap();
    a.session.submit_raw(r#"{"type":"teleport"}"#).await.unwrap();
    a.session.cursor_moved(1, 2).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(a.session.state(), SessionState::Active);
    let snap = hub.list(&RoomId::from("doc-1")).await.unwrap();
    assert_eq!(snap.records[0].cursor, Some(Position::new(1, 2)));
}

#[tokio::test(start_paused = true)]
async fn coordinator_restart_is_repopulated_by_sessions() {
    let hub = hub();
    let room = RoomId::from("doc-1");
    let mut a = Viewer::connect(&hub, "doc-1").await;
    let mut b = Viewer::connect(&hub, "doc-1").await;
    a.session.cursor_moved(7, 1).await.unwrap();
    a.pump().await;
    b.pump().await;

    let old = hub.directory().get(&room).unwrap();
    old.shutdown().await;
    a.pump().await;
    b.pump().await;
    assert!(old.is_closed());

    let snap = hub.list(&room).await.unwrap();
    assert_eq!(snap.records.len(), 2);
    let restored = snap.records.iter().find(|r| r.viewer_id == a.id()).unwrap();
    assert_eq!(restored.cursor, Some(Position::new(7, 1)));
    assert_eq!(a.view.len(), 2);
    assert_eq!(b.view.len(), 2);
    assert!(a.snapshots >= 2);

    let c = Viewer::connect(&hub, "doc-1").await;
    assert_eq!(c.session.display_name(), "Anonymous User 3");
}

#[tokio::test(start_paused = true)]
async fn full_outbound_queue_resyncs_on_heartbeat() {
    let hub = hub();
    // Room for the snapshot and the viewer's own join, nothing more.
    let mut a = Viewer::connect_with(&hub, "doc-1", CallerContext::anonymous(), 2).await;
    let _b = Viewer::connect(&hub, "doc-1").await;
    tokio::time::sleep(SETTLE).await;

    a.pump().await;
    assert_eq!(a.view.len(), 1);

    a.session.heartbeat().await.unwrap();
    a.pump().await;
    assert_eq!(a.snapshots, 2);
    assert_eq!(a.view.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn full_outbound_queue_resyncs_on_lease_tick_without_heartbeat() {
    let hub = hub();
    let mut a = Viewer::connect_with(&hub, "doc-1", CallerContext::anonymous(), 2).await;
    let b = Viewer::connect(&hub, "doc-1").await;
    tokio::time::sleep(SETTLE).await;
    a.pump().await;
    assert_eq!(a.view.len(), 1);

    // `a` only ever answers transport pings, never a JSON heartbeat.
    b.session.cursor_moved(3, 3).await.unwrap();
    tokio::time::sleep(hub.config().lease_renew_interval + SETTLE).await;
    a.pump().await;

    assert!(a.snapshots >= 2);
    assert_eq!(a.view.len(), 2);
    assert_eq!(a.cursor_of(&b.id()), Some(Position::new(3, 3)));
}

#[tokio::test(start_paused = true)]
async fn silent_transport_grace_counts_from_last_contact() {
    let hub = hub();
    let grace = hub.config().grace_window;
    let (tx, _rx) = mpsc::channel(64);
    let transport = tx.downgrade();
    let a = hub
        .connect(&RoomId::from("doc-1"), &CallerContext::anonymous(), tx)
        .await
        .unwrap();
    let mut b = Viewer::connect(&hub, "doc-1").await;
    b.pump().await;
    assert_eq!(b.view.len(), 2);

    assert!(a.transport_silent(&transport, grace * 3 / 4).await);
    assert_eq!(a.state(), SessionState::Disconnected);

    tokio::time::sleep(grace / 4 + SETTLE).await;
    b.pump().await;
    assert!(b.view.get(a.viewer_id()).is_none());
    assert_eq!(a.state(), SessionState::Removed);
}

#[tokio::test(start_paused = true)]
async fn silence_reported_by_replaced_transport_is_ignored() {
    let hub = hub();
    let (old_tx, _old_rx) = mpsc::channel(64);
    let stale = old_tx.downgrade();
    let a = hub
        .connect(&RoomId::from("doc-1"), &CallerContext::anonymous(), old_tx)
        .await
        .unwrap();
    let (new_tx, _new_rx) = mpsc::channel(64);
    a.resume(new_tx).await.unwrap();

    assert!(!a.transport_silent(&stale, Duration::ZERO).await);
    tokio::time::sleep(hub.config().grace_window * 2).await;
    assert_eq!(a.state(), SessionState::Active);
    assert_eq!(hub.list(&RoomId::from("doc-1")).await.unwrap().records.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn member_count_tracks_live_sessions() {
    let hub = hub();
    let room = RoomId::from("doc-1");
    let mut viewers = Vec::new();
    for _ in 0..6 {
        viewers.push(Viewer::connect(&hub, "doc-1").await);
    }
    for v in viewers.iter().step_by(2) {
        v.session.disconnect().await.unwrap();
        v.session.wait_removed().await;
    }
    let snap = hub.list(&room).await.unwrap();
    let live = viewers.iter().filter(|v| !v.session.is_removed()).count();
    assert_eq!(snap.records.len(), live);
    assert_eq!(live, 3);
}
