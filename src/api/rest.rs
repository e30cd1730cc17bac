// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// `/live/*` drives the orchestrator lifecycle and exposes recent activity;
// `/circuit-breaker` is an action dispatcher over the breaker (every
// response carries the breaker's current state). `/archive/run` is the
// scheduler hook, guarded by CRON_SECRET when that variable is set.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::breaker::BreakerConfigPatch;
use crate::orchestrator::{InitError, OrchestratorState};
use crate::sources::SourceEntry;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // ── Live orchestrator ───────────────────────────────────────
        .route("/live/start", post(live_start))
        .route("/live/status", get(live_status))
        .route("/live/stop", delete(live_stop))
        .route(
            "/live/activity",
            get(live_activity).post(crate::api::sse::activity_stream),
        )
        // ── Circuit breaker ─────────────────────────────────────────
        .route("/circuit-breaker", get(breaker_get).post(breaker_post))
        // ── Scheduler hook ──────────────────────────────────────────
        .route("/archive/run", post(archive_run))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "orchestrator": state.orchestrator.state(),
        "breaker": state.breaker.state(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// /live endpoints
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    sources: Option<Vec<SourceEntry>>,
}

fn init_error_response(e: InitError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        InitError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        InitError::Auth(_) => StatusCode::UNAUTHORIZED,
        InitError::IllegalState(_) => StatusCode::CONFLICT,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

async fn live_start(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRequest>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let requested = body.and_then(|Json(req)| req.sources);
    let orchestrator = &state.orchestrator;

    match orchestrator.state() {
        OrchestratorState::Running => {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({ "error": "orchestrator already running" })),
            ));
        }
        OrchestratorState::Ready => {
            if let Some(sources) = requested {
                orchestrator
                    .update_config(sources)
                    .await
                    .map_err(init_error_response)?;
            }
        }
        _ => {
            let sources =
                requested.unwrap_or_else(|| state.config.read().sources.clone());
            orchestrator.initialize(sources).map_err(init_error_response)?;
        }
    }

    orchestrator.start().map_err(init_error_response)?;
    info!("orchestrator started via API");

    Ok(Json(json!({
        "started": true,
        "state": orchestrator.state(),
        "sources": state.config_summary(),
    })))
}

async fn live_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.live_status())
}

async fn live_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.orchestrator.stop().await;
    info!("orchestrator stopped via API");
    Json(json!({
        "stopped": true,
        "state": state.orchestrator.state(),
    }))
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    /// Lookback in milliseconds.
    #[serde(default = "default_since_ms")]
    since: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_since_ms() -> i64 {
    60 * 60 * 1000
}

fn default_limit() -> usize {
    50
}

async fn live_activity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> impl IntoResponse {
    let window = state.activity_log.recent_since(query.since);

    // Detections are events that actually carry symbols; newest first.
    let detections: Vec<_> = window
        .iter()
        .rev()
        .filter(|e| !e.event.symbols.is_empty())
        .take(query.limit)
        .map(|e| e.event.as_ref().clone())
        .collect();

    let mut mention_counts: HashMap<String, usize> = HashMap::new();
    for entry in &window {
        for symbol in &entry.event.symbols {
            *mention_counts.entry(symbol.clone()).or_insert(0) += 1;
        }
    }
    let mut top_symbols: Vec<_> = mention_counts.into_iter().collect();
    top_symbols.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top_symbols.truncate(20);

    Json(json!({
        "total_events": window.len(),
        "detections": detections,
        "top_symbols": top_symbols
            .into_iter()
            .map(|(symbol, mentions)| json!({ "symbol": symbol, "mentions": mentions }))
            .collect::<Vec<_>>(),
        "active_signals": state.orchestrator.get_active_signals(),
    }))
}

// =============================================================================
// /circuit-breaker action dispatcher
// =============================================================================

#[derive(Debug, Deserialize)]
struct ActionQuery {
    #[serde(default)]
    action: Option<String>,
}

async fn breaker_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let breaker = &state.breaker;
    let action = query.action.as_deref().unwrap_or("status");

    let body = match action {
        "status" => json!({ "state": breaker.state(), "status": breaker.status() }),
        "metrics" => json!({ "state": breaker.state(), "metrics": breaker.metrics() }),
        "failures" => json!({ "state": breaker.state(), "failures": breaker.recent_failures() }),
        "config" => json!({ "state": breaker.state(), "config": breaker.config() }),
        "health" => json!({ "state": breaker.state(), "healthy": breaker.is_healthy() }),
        "dashboard" => json!({
            "state": breaker.state(),
            "status": breaker.status(),
            "metrics": breaker.metrics(),
            "recent_failures": breaker.recent_failures().len(),
            "config": breaker.config(),
        }),
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown action '{other}'") })),
            ));
        }
    };
    Ok(Json(body))
}

#[derive(Debug, Default, Deserialize)]
struct BreakerPostBody {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    daily_pnl: Option<f64>,
    #[serde(default)]
    drawdown: Option<f64>,
    #[serde(default)]
    pnl: Option<f64>,
    #[serde(default)]
    config: Option<BreakerConfigPatch>,
    #[serde(default)]
    should_fail: Option<bool>,
}

async fn breaker_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionQuery>,
    body: Option<Json<BreakerPostBody>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let breaker = &state.breaker;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let Some(action) = query.action else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "action query parameter required" })),
        ));
    };

    let response = match action.as_str() {
        "force_open" => {
            let reason = body.reason.unwrap_or_else(|| "manual".to_string());
            breaker.force_open(&reason);
            json!({ "state": breaker.state(), "forced": "open" })
        }
        "force_close" => {
            breaker.force_close();
            json!({ "state": breaker.state(), "forced": "close" })
        }
        "emergency_stop" => {
            let reason = body.reason.unwrap_or_else(|| "manual".to_string());
            breaker.emergency_stop(&reason);
            json!({ "state": breaker.state(), "emergency": true })
        }
        "update_metrics" => {
            if let Some(pnl) = body.daily_pnl {
                breaker.update_daily_pnl(pnl);
            }
            if let Some(drawdown) = body.drawdown {
                breaker.update_drawdown(drawdown);
            }
            if let Some(pnl) = body.pnl {
                breaker.record_trade(pnl);
            }
            json!({ "state": breaker.state(), "metrics": breaker.metrics() })
        }
        "update_config" => {
            let Some(patch) = body.config else {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "config body required" })),
                ));
            };
            breaker.update_config(patch);
            json!({ "state": breaker.state(), "config": breaker.config() })
        }
        "reset_daily_metrics" => {
            breaker.reset_daily_metrics();
            json!({ "state": breaker.state(), "metrics": breaker.metrics() })
        }
        "test_operation" => {
            let should_fail = body.should_fail.unwrap_or(false);
            let result = breaker
                .execute("test_operation", || async move {
                    if should_fail {
                        anyhow::bail!("api error: simulated test failure")
                    }
                    Ok(json!({ "ok": true }))
                })
                .await;
            match result {
                Ok(value) => json!({ "state": breaker.state(), "result": value }),
                Err(e) => json!({ "state": breaker.state(), "error": e.to_string() }),
            }
        }
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown action '{other}'") })),
            ));
        }
    };
    Ok(Json(response))
}

// =============================================================================
// Scheduler hook
// =============================================================================

/// When CRON_SECRET is set, the caller must present it (x-cron-secret header
/// or bearer token).
fn cron_authorized(headers: &HeaderMap) -> bool {
    let Ok(secret) = std::env::var("CRON_SECRET") else {
        return true;
    };
    if secret.is_empty() {
        return true;
    }

    let from_header = headers
        .get("x-cron-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == secret)
        .unwrap_or(false);
    let from_bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v == secret)
        .unwrap_or(false);

    from_header || from_bearer
}

async fn archive_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !cron_authorized(&headers) {
        warn!("archive run rejected: bad cron secret");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid cron secret" })),
        ));
    }

    match state.archiver.run_once().await {
        Ok(entry) => Ok(Json(json!({ "archived": true, "entry": entry }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}
