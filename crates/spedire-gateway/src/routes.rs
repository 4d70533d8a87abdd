//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use spedire_automations::NewAutomation;
use spedire_core::SpedireError;

use crate::server::{AppState, json_error, secret_matches};

const DEFAULT_RUNS_LIMIT: usize = 50;

/// Map a core error onto an HTTP status and JSON body.
fn error_response(err: SpedireError) -> Response {
    let status = match &err {
        SpedireError::NotFound(_) => StatusCode::NOT_FOUND,
        SpedireError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ Admin request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!({
            "ok": false,
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
        .into_response()
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "spedire-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let lock = state.dispatcher.lock();
    Json(serde_json::json!({
        "name": "spedire",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "tolerance_minutes": state.tolerance_minutes,
        "handlers": state.dispatcher.registry().slugs(),
        "lock": {
            "backend": lock.backend(),
            "fail_mode": lock.fail_mode(),
            "ttl_secs": lock.ttl().as_secs(),
        },
        "gateway": {
            "host": state.gateway_config.host,
            "port": state.gateway_config.port,
            "cron_enabled": !state.gateway_config.cron_secret.is_empty(),
            "admin_token_required": !state.gateway_config.admin_token.is_empty(),
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CronQuery {
    pub tolerance: Option<u32>,
}

/// Cron tick: evaluate every enabled automation once.
///
/// Fails closed: without a configured secret nothing runs.
pub async fn cron_dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Response {
    let secret = &state.gateway_config.cron_secret;
    if secret.is_empty() {
        tracing::error!("❌ Cron tick refused: cron_secret not configured");
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "CRON_SECRET not configured");
    }

    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| secret_matches(token, secret));
    if !authorized {
        tracing::warn!("🔒 Cron tick rejected: bad bearer token");
        return json_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let tolerance = query.tolerance.unwrap_or(state.tolerance_minutes);
    let batch = state.dispatcher.run_dispatcher(tolerance).await;
    Json(serde_json::json!({
        "ok": true,
        "checked": batch.checked,
        "executed": batch.executed,
        "skipped": batch.skipped,
        "results": batch.results,
    }))
    .into_response()
}

/// List automations, each with its latest run.
pub async fn list_automations(State(state): State<Arc<AppState>>) -> Response {
    match state.admin.get_automations().await {
        Ok(automations) => Json(serde_json::json!({
            "ok": true,
            "automations": automations,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Create an automation (always disabled until toggled).
pub async fn create_automation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewAutomation>,
) -> Response {
    match state.admin.create_automation(body).await {
        Ok(automation) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"ok": true, "automation": automation})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

pub async fn toggle_automation(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Response {
    match state.admin.toggle_automation_enabled(&slug, body.enabled).await {
        Ok(automation) => {
            Json(serde_json::json!({"ok": true, "automation": automation})).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Replace the config; the body is the new config object.
pub async fn update_automation_config(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    match state.admin.update_automation_config(&slug, body).await {
        Ok(automation) => {
            Json(serde_json::json!({"ok": true, "automation": automation})).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Run now with trigger `api`; answers once the run is terminal.
pub async fn run_automation(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    match state.admin.run_automation_api(&slug).await {
        Ok(run) => Json(serde_json::json!({"ok": true, "run": run})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

pub async fn list_automation_runs(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    match state.admin.get_automation_runs(&slug, limit).await {
        Ok(runs) => Json(serde_json::json!({"ok": true, "runs": runs})).into_response(),
        Err(e) => error_response(e),
    }
}

/// Lock counters since process start.
pub async fn lock_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "stats": state.dispatcher.lock().stats(),
    }))
}
