//! `PresenceServer`: axum HTTP + WebSocket front for the presence hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use copresence_core::{PresenceRecord, RoomId, SessionToken};
use copresence_engine::{CallerContext, PresenceHub};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SocketContext, run_viewer_socket};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Presence hub.
    pub hub: Arc<PresenceHub>,
    /// Transport settings.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
    /// Open viewer sockets.
    pub connections: Arc<AtomicUsize>,
    /// When the server started.
    pub start_time: Instant,
}

/// Query string accepted on the viewer socket route.
#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    /// Bearer token for the identity resolver.
    pub token: Option<String>,
    /// Session token from an earlier connection.
    pub resume: Option<String>,
}

/// Body of `GET /rooms/{room_id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    /// Room asked for.
    pub room_id: RoomId,
    /// Room sequence the listing reflects.
    pub seq: u64,
    /// Live records.
    pub records: Vec<PresenceRecord>,
}

/// The presence server.
pub struct PresenceServer {
    state: AppState,
}

impl PresenceServer {
    /// Server in front of `hub`.
    pub fn new(config: ServerConfig, hub: Arc<PresenceHub>, metrics: PrometheusHandle) -> Self {
        Self {
            state: AppState {
                hub,
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics,
                connections: Arc::new(AtomicUsize::new(0)),
                start_time: Instant::now(),
            },
        }
    }

    /// Router with every route.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/rooms/{room_id}", get(room_handler))
            .route("/rooms/{room_id}/ws", get(ws_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.state.clone())
    }

    /// Bind and serve in the background until shutdown fires.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.state.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%local, "presence server listening");

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "server stopped with error");
            }
        });
        Ok((local, handle))
    }

    /// Presence hub.
    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.state.hub
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Transport settings.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Open viewer sockets.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Acquire),
        state.hub.session_count(),
        state.hub.room_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// GET /rooms/{room_id}
async fn room_handler(Path(room_id): Path<String>, State(state): State<AppState>) -> Response {
    let room_id = RoomId::from(room_id);
    match state.hub.list(&room_id).await {
        Ok(snapshot) => Json(RoomListing {
            room_id,
            seq: snapshot.seq,
            records: snapshot.records,
        })
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.code()).into_response(),
    }
}

/// GET /rooms/{room_id}/ws
async fn ws_handler(
    Path(room_id): Path<String>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if state.connections.load(Ordering::Acquire) >= state.config.max_connections {
        counter!(WS_REJECTED_TOTAL).increment(1);
        warn!(max = state.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let caller = caller_context(&query, &headers);
    let ctx = SocketContext {
        hub: state.hub.clone(),
        config: state.config.clone(),
        connections: state.connections.clone(),
        shutdown: state.shutdown.token(),
    };
    let room_id = RoomId::from(room_id);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_viewer_socket(socket, room_id, caller, ctx))
}

/// Build the caller context from the query string and headers. The query
/// token wins over an `Authorization: Bearer` header.
pub fn caller_context(query: &SocketQuery, headers: &HeaderMap) -> CallerContext {
    let bearer = query.token.clone().or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_owned())
    });
    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    CallerContext {
        bearer: bearer.filter(|t| !t.is_empty()),
        resume_token: query
            .resume
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(SessionToken::from),
        remote_addr,
    }
}
