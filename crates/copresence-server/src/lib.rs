//! # copresence-server
//!
//! Axum HTTP + `WebSocket` transport for the presence engine.
//!
//! - `GET /rooms/{room_id}/ws`: viewer socket (join, resume, takeover)
//! - `GET /rooms/{room_id}`: read-only membership snapshot
//! - `GET /health` and `GET /metrics` (Prometheus text)
//! - Ping/pong heartbeat; a silent socket is treated as a lost transport
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::PresenceServer;
pub use shutdown::ShutdownCoordinator;
