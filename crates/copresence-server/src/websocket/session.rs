//! One viewer socket from upgrade to close.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use copresence_core::{RoomId, ServerEvent};
use copresence_engine::{CallerContext, PresenceHub, SessionHandle};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::{FrameAction, classify};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{
    PRESENCE_COMMANDS_TOTAL, PRESENCE_RESUMES_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_HEARTBEAT_TIMEOUTS_TOTAL, WS_MALFORMED_FRAMES_TOTAL,
};

/// Shared pieces a socket needs.
#[derive(Clone)]
pub struct SocketContext {
    /// Presence hub.
    pub hub: Arc<PresenceHub>,
    /// Transport settings.
    pub config: Arc<ServerConfig>,
    /// Open socket count, shared with the router.
    pub connections: Arc<AtomicUsize>,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
}

/// Holds one slot in the open socket count.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::AcqRel);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        Self(counter.clone())
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

type WsSink = SplitSink<WebSocket, Message>;

/// Drive a viewer socket.
///
/// 1. Places the caller through the hub (fresh join, resume, or takeover)
/// 2. Forwards the session's events and pings from a writer task
/// 3. Feeds decoded frames to the session; malformed frames are counted
/// 4. On close, error, or heartbeat timeout, drops the outbound receiver so
///    the session starts its grace window. A heartbeat timeout first tells
///    the session how long the client has been silent, so the window
///    counts from the last frame rather than from detection
#[instrument(skip_all, fields(%room_id))]
pub async fn run_viewer_socket(ws: WebSocket, room_id: RoomId, caller: CallerContext, ctx: SocketContext) {
    let _slot = ConnectionSlot::acquire(&ctx.connections);
    let connection = Arc::new(ClientConnection::new(room_id.clone()));
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerEvent>(ctx.config.outbound_capacity.max(1));
    let transport = out_tx.downgrade();

    let session = match ctx.hub.connect(&room_id, &caller, out_tx).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "could not place viewer");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.code().into(),
                })))
                .await;
            return;
        }
    };
    connection.bind_session(session.token().clone(), session.viewer_id().clone());
    if caller.resume_token.as_ref() == Some(session.token()) {
        counter!(PRESENCE_RESUMES_TOTAL).increment(1);
    }
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(
        conn = %connection.id,
        viewer_id = %session.viewer_id(),
        token = %session.token(),
        "viewer socket attached"
    );

    let cancel = ctx.shutdown.child_token();
    let writer = spawn_writer(ws_tx, out_rx, &ctx.config, cancel.clone());
    let heartbeat = {
        let connection = connection.clone();
        let session = session.clone();
        let interval = ctx.config.heartbeat_interval;
        let timeout = ctx.config.heartbeat_timeout;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(connection.clone(), interval, timeout, cancel.clone()).await;
            if result == HeartbeatResult::TimedOut {
                let silent_for = connection.last_seen_elapsed();
                if !session.transport_silent(&transport, silent_for).await {
                    debug!(conn = %connection.id, "socket no longer drives the session");
                }
                cancel.cancel();
            }
            result
        })
    };

    let mut reason = read_frames(&mut ws_rx, &session, &connection, &cancel).await;
    cancel.cancel();
    if let Ok(HeartbeatResult::TimedOut) = heartbeat.await {
        warn!(conn = %connection.id, "heartbeat timed out");
        counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
        reason = "heartbeat_timeout";
    }
    let _ = writer.await;

    info!(
        conn = %connection.id,
        reason,
        frames = connection.frame_count(),
        malformed = connection.malformed_count(),
        "viewer socket closed"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// Read until the client leaves or the socket is cancelled. Returns why.
async fn read_frames(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    session: &SessionHandle,
    connection: &ClientConnection,
    cancel: &CancellationToken,
) -> &'static str {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return "cancelled",
            frame = ws_rx.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                return "read_error";
            }
            None => return "stream_ended",
        };
        connection.mark_alive();
        let _ = connection.record_frame();
        match classify(&message) {
            FrameAction::Command(cmd) => {
                counter!(PRESENCE_COMMANDS_TOTAL).increment(1);
                if session.submit(cmd).await.is_err() {
                    return "session_ended";
                }
            }
            FrameAction::Malformed(e) => {
                let _ = connection.record_malformed();
                counter!(WS_MALFORMED_FRAMES_TOTAL).increment(1);
                debug!(conn = %connection.id, error = %e, "dropping malformed frame");
            }
            FrameAction::Close => return "client_closed",
            FrameAction::Liveness => {}
        }
    }
}

/// Forward session events and send pings until cancelled or the session
/// lets go of the outbound channel. Cancels the socket on exit.
fn spawn_writer(
    mut ws_tx: WsSink,
    mut out_rx: mpsc::Receiver<ServerEvent>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let every = config.heartbeat_interval;
    tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = out_rx.recv() => {
                    let Some(event) = event else {
                        debug!("session released this socket");
                        break;
                    };
                    let json = match event.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize event");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        drop(out_rx);
        cancel.cancel();
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    })
}
