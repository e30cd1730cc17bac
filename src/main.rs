// =============================================================================
// Pulsewire Sentiment Engine — Main Entry Point
// =============================================================================
//
// Boot order: env + logging, config, shared state, API server, archiver
// loop, then (optionally) the orchestrator itself when PULSEWIRE_AUTOSTART
// is set. Without autostart the process serves the API and waits for
// POST /live/start.
//
// Exit codes: 0 normal stop, 2 invalid configuration, 3 unrecoverable
// source authentication failure at initialize.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod activity;
mod api;
mod app_state;
mod archive;
mod breaker;
mod correlator;
mod extract;
mod orchestrator;
mod runtime_config;
mod sources;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::orchestrator::InitError;
use crate::runtime_config::EngineConfig;

const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_SOURCE_AUTH: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Pulsewire Sentiment Engine — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("PULSEWIRE_CONFIG").unwrap_or_else(|_| "pulsewire.json".into());

    let config = if std::path::Path::new(&config_path).exists() {
        match EngineConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %config_path, error = %e, "config file is invalid");
                std::process::exit(EXIT_INVALID_CONFIG);
            }
        }
    } else {
        warn!(path = %config_path, "no config file — using defaults");
        EngineConfig::default()
    };

    // ── 3. Shared state ──────────────────────────────────────────────────
    let state = AppState::new(config);

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("PULSEWIRE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %api_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 5. Archiver loop ─────────────────────────────────────────────────
    let archive_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(archive_state.archiver.interval());
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            if archive_state.activity_log.is_empty() {
                continue;
            }
            if let Err(e) = archive_state.archiver.run_once().await {
                warn!(error = %e, "periodic archive run failed");
            }
        }
    });

    // ── 6. Optional autostart ────────────────────────────────────────────
    let autostart = std::env::var("PULSEWIRE_AUTOSTART")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if autostart {
        let sources = state.config.read().sources.clone();
        match state
            .orchestrator
            .initialize(sources)
            .and_then(|_| state.orchestrator.start())
        {
            Ok(()) => info!("orchestrator autostarted"),
            Err(InitError::Auth(msg)) => {
                error!(error = %msg, "source authentication failed at initialize");
                std::process::exit(EXIT_SOURCE_AUTH);
            }
            Err(e) => {
                error!(error = %e, "orchestrator failed to start");
                std::process::exit(EXIT_INVALID_CONFIG);
            }
        }
    } else {
        info!("waiting for POST /live/start (set PULSEWIRE_AUTOSTART=1 to start immediately)");
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.orchestrator.stop().await;

    let config_snapshot = state.config.read().clone();
    if let Err(e) = config_snapshot.save(&config_path) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Pulsewire shut down complete.");
    Ok(())
}
