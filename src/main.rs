// =============================================================================
// Momentum Gate — Intraday ORB Trading Engine — Main Entry Point
// =============================================================================
//
// Wires configuration, shared state, the dashboard API server, and the
// trading engine, then waits for Ctrl-C (or a dashboard stop / kill switch)
// and shuts down gracefully.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod engine;
mod gateway;
mod indicators;
mod journal;
mod market_data;
mod position;
mod reconciler;
mod screener;
mod strategy;
mod subscription;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::engine::Engine;
use crate::gateway::BrokerClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("MOMENTUM_GATE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!(
        sandbox = config.broker.use_sandbox,
        base_url = config.broker.base_url(),
        "momentum-gate starting"
    );

    // ── 2. Shared state & broker client ──────────────────────────────────
    let state = Arc::new(AppState::new(&config));
    let client = Arc::new(BrokerClient::new(
        &config.broker,
        &config.engine.token_cache_path,
    ));

    // ── 3. Dashboard API server ──────────────────────────────────────────
    let api_ctx = api::rest::ApiContext {
        state: state.clone(),
        client: client.clone(),
    };
    let bind_addr = config.engine.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_ctx);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    // ── 4. Trading engine ────────────────────────────────────────────────
    let realtime_uri = config.broker.realtime_uri().to_string();
    let engine = Engine::new(state.clone(), client.clone());
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = engine.run(&realtime_uri).await {
            error!(error = %e, "engine exited with error");
        }
    });

    // ── 5. Graceful shutdown on Ctrl-C ───────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
            state.request_stop();
        }
        _ = async {
            let mut stop = state.stop_signal();
            let _ = stop.wait_for(|s| *s).await;
        } => {
            info!("stop requested internally");
        }
    }

    if let Err(e) = engine_handle.await {
        error!(error = %e, "engine task join failed");
    }

    info!(status = %state.status(), "momentum-gate shut down");
    Ok(())
}
