// =============================================================================
// Dashboard REST API — Axum 0.7
// =============================================================================
//
// Read-only snapshots plus three control surfaces (stop, kill switch,
// strategy-config update) under `/api/v1/`. The health endpoint is public;
// everything else requires the admin token from the MOMENTUM_GATE_ADMIN_TOKEN
// environment variable, compared in constant time.
//
// The dashboard only ever receives cloned snapshots; it never holds a live
// reference into engine state.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::config::StrategyConfig;
use crate::engine;
use crate::gateway::BrokerClient;

/// Environment variable holding the admin token.
const ADMIN_TOKEN_ENV: &str = "MOMENTUM_GATE_ADMIN_TOKEN";

/// Shared context for every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub client: Arc<BrokerClient>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/candidates", get(candidates))
        .route("/api/v1/logs", get(logs))
        .route("/api/v1/journal", get(journal))
        .route("/api/v1/journal/stats", get(journal_stats))
        .route("/api/v1/config/strategy", get(get_strategy))
        .route("/api/v1/config/strategy", post(set_strategy))
        .route("/api/v1/control/stop", post(control_stop))
        .route("/api/v1/control/kill", post(control_kill))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Authentication
// =============================================================================

/// Compare two byte slices in constant time; every byte is examined even
/// after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

fn forbidden(message: &'static str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Validate `Authorization: Bearer <token>` against the environment token.
fn require_auth(headers: &HeaderMap) -> Result<(), Response> {
    let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("{ADMIN_TOKEN_ENV} is not set, rejecting authenticated request");
        return Err(forbidden("server authentication not configured"));
    }

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            warn!("invalid or missing admin token");
            Err(forbidden("invalid authorization token"))
        }
    }
}

// =============================================================================
// Read endpoints
// =============================================================================

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "engine_status": ctx.state.status(),
        "state_version": ctx.state.current_state_version(),
    }))
}

async fn full_state(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    Json(ctx.state.build_snapshot()).into_response()
}

async fn positions(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    Json(ctx.state.ledger.snapshot()).into_response()
}

async fn candidates(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    Json(ctx.state.candidates.read().clone()).into_response()
}

async fn logs(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    Json(ctx.state.recent_logs()).into_response()
}

async fn journal(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    match ctx.state.journal.read_all() {
        Ok(records) => Json(records).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn journal_stats(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    match ctx.state.journal.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// =============================================================================
// Strategy configuration
// =============================================================================

async fn get_strategy(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    Json((*ctx.state.strategy()).clone()).into_response()
}

/// Runtime-mutable subset of the strategy thresholds. Absent fields keep
/// their current values; updates only apply to positions opened afterwards.
#[derive(Debug, Default, Deserialize)]
pub struct StrategyUpdate {
    #[serde(default)]
    pub breakout_buffer_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub partial_take_profit_pct: Option<f64>,
    #[serde(default)]
    pub disable_partial_take_profit: Option<bool>,
    #[serde(default)]
    pub partial_take_profit_ratio: Option<f64>,
    #[serde(default)]
    pub rvol_threshold: Option<f64>,
    #[serde(default)]
    pub obi_threshold: Option<f64>,
    #[serde(default)]
    pub strength_threshold: Option<f64>,
    #[serde(default)]
    pub max_concurrent_positions: Option<usize>,
    #[serde(default)]
    pub investment_amount: Option<f64>,
    #[serde(default)]
    pub max_target_stocks: Option<usize>,
    #[serde(default)]
    pub screening_min_price: Option<f64>,
    #[serde(default)]
    pub screening_min_surge_rate: Option<f64>,
}

/// Apply an update on top of the current snapshot.
fn merged_strategy(current: &StrategyConfig, update: &StrategyUpdate) -> StrategyConfig {
    let mut next = current.clone();

    macro_rules! merge {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = update.$field { next.$field = v; })*
        };
    }
    merge!(
        breakout_buffer_pct,
        take_profit_pct,
        stop_loss_pct,
        partial_take_profit_ratio,
        rvol_threshold,
        obi_threshold,
        strength_threshold,
        max_concurrent_positions,
        investment_amount,
        max_target_stocks,
        screening_min_price,
        screening_min_surge_rate,
    );

    if let Some(v) = update.partial_take_profit_pct {
        next.partial_take_profit_pct = Some(v);
    }
    if update.disable_partial_take_profit == Some(true) {
        next.partial_take_profit_pct = None;
    }

    next
}

async fn set_strategy(
    headers: HeaderMap,
    State(ctx): State<ApiContext>,
    Json(update): Json<StrategyUpdate>,
) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }

    let next = merged_strategy(&ctx.state.strategy(), &update);
    info!("strategy config updated from dashboard");
    ctx.state.push_log("strategy config updated");
    ctx.state.swap_strategy(next.clone());
    Json(next).into_response()
}

// =============================================================================
// Control endpoints
// =============================================================================

async fn control_stop(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    info!("stop requested from dashboard");
    ctx.state.push_log("stop requested from dashboard");
    ctx.state.request_stop();
    Json(serde_json::json!({ "stopping": true })).into_response()
}

async fn control_kill(headers: HeaderMap, State(ctx): State<ApiContext>) -> Response {
    if let Err(r) = require_auth(&headers) {
        return r;
    }
    info!("kill switch requested from dashboard");
    let state = ctx.state.clone();
    let client = ctx.client.clone();
    tokio::spawn(async move {
        engine::execute_kill_switch(state, client).await;
    });
    Json(serde_json::json!({ "kill_switch": "activated" })).into_response()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn merge_keeps_absent_fields() {
        let current = StrategyConfig::default();
        let update = StrategyUpdate {
            take_profit_pct: Some(4.0),
            ..Default::default()
        };
        let next = merged_strategy(&current, &update);
        assert!((next.take_profit_pct - 4.0).abs() < f64::EPSILON);
        assert!((next.stop_loss_pct - current.stop_loss_pct).abs() < f64::EPSILON);
        assert_eq!(next.max_concurrent_positions, current.max_concurrent_positions);
    }

    #[test]
    fn merge_can_disable_partial_take_profit() {
        let current = StrategyConfig::default();
        assert!(current.partial_take_profit_pct.is_some());

        let update = StrategyUpdate {
            disable_partial_take_profit: Some(true),
            ..Default::default()
        };
        let next = merged_strategy(&current, &update);
        assert_eq!(next.partial_take_profit_pct, None);
    }

    #[test]
    fn merge_sets_new_partial_threshold() {
        let current = StrategyConfig::default();
        let update = StrategyUpdate {
            partial_take_profit_pct: Some(2.0),
            ..Default::default()
        };
        let next = merged_strategy(&current, &update);
        assert_eq!(next.partial_take_profit_pct, Some(2.0));
    }
}
