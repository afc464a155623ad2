//! # copresence
//!
//! Co-presence server binary: loads settings, wires the engine to the
//! HTTP/WebSocket transport, and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use copresence_engine::{EngineConfig, PresenceHub, StaticTokenResolver};
use copresence_server::{PresenceServer, ServerConfig};
use copresence_settings::CopresenceSettings;

/// How often empty rooms are pruned.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Live co-presence server.
#[derive(Parser, Debug)]
#[command(name = "copresence", about = "Live co-presence server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.copresence/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or `EnvFilter` directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<CopresenceSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(copresence_settings::settings_path);
        let mut settings = copresence_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        Ok(settings)
    }

    fn apply(&self, settings: &mut CopresenceSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    if settings.logging.json {
        copresence_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        copresence_core::logging::init_subscriber(&settings.logging.level);
    }

    let metrics = copresence_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let resolver = Arc::new(StaticTokenResolver::from(&settings.auth));
    let hub = Arc::new(PresenceHub::new(
        EngineConfig::from(&settings.presence),
        resolver,
    ));
    let janitor = hub.spawn_janitor(JANITOR_INTERVAL);

    let server = PresenceServer::new(ServerConfig::from(&settings.server), hub.clone(), metrics);
    let (addr, handle) = server.listen().await.context("Failed to start server")?;
    tracing::info!(
        tokens = settings.auth.tokens.len(),
        "copresence listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    hub.shutdown().await;
    server
        .shutdown()
        .graceful_shutdown(vec![handle, janitor], None)
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["copresence"]);
        let mut settings = CopresenceSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 4040);
        assert!(!settings.logging.json);
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "copresence",
            "--host",
            "0.0.0.0",
            "--port",
            "0",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut settings = CopresenceSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn cli_settings_path() {
        let cli = Cli::parse_from(["copresence", "--settings", "/tmp/x.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/x.json")));
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let cli = Cli::parse_from(["copresence", "--settings", "/nonexistent/settings.json"]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.presence.grace_window_ms, 5_000);
    }
}
