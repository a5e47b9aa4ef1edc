use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::state::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Process alive.
pub async fn live() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn probe_db(state: &AppState) -> (bool, f64) {
    let started = Instant::now();
    let ok = tokio::time::timeout(
        PROBE_TIMEOUT,
        state
            .db
            .run_command(bson::doc! { "ping": 1 }),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);
    (ok, started.elapsed().as_secs_f64() * 1000.0)
}

async fn probe_store(state: &AppState) -> (bool, f64) {
    let started = Instant::now();
    let ok = tokio::time::timeout(PROBE_TIMEOUT, state.store.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    (ok, started.elapsed().as_secs_f64() * 1000.0)
}

/// Ready to take traffic: database, shared store and at least one live
/// media worker.
pub async fn ready(State(state): State<AppState>) -> Response {
    let ((db_ok, _), (store_ok, _)) = tokio::join!(probe_db(&state), probe_store(&state));
    let workers = state.worker_pool.live_count();

    if db_ok && store_ok && workers >= 1 {
        (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": db_ok,
                "sharedStore": store_ok,
                "workers": workers,
            })),
        )
            .into_response()
    }
}

/// Component statuses with response times. Dead database or worker pool is
/// unhealthy; a dead shared store alone only degrades.
pub async fn health(State(state): State<AppState>) -> Response {
    let ((db_ok, db_ms), (store_ok, store_ms)) =
        tokio::join!(probe_db(&state), probe_store(&state));
    let workers = state.worker_pool.live_count();

    let status = if db_ok && store_ok && workers >= 1 {
        "healthy"
    } else if db_ok && workers >= 1 {
        "degraded"
    } else {
        "unhealthy"
    };
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = json!({
        "status": status,
        "components": {
            "database": { "up": db_ok, "responseTimeMs": db_ms },
            "sharedStore": { "up": store_ok, "responseTimeMs": store_ms },
            "workers": { "up": workers >= 1, "live": workers, "total": state.worker_pool.worker_count() },
        },
        "counts": {
            "sessions": state.signals.session_count(),
            "routers": state.routers.count(),
            "transports": state.transports.count(),
            "producers": state.producers.count(),
            "consumers": state.consumers.count(),
            "recordings": state.recording.active_count(),
        },
    });
    (code, Json(body)).into_response()
}

pub async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime_secs = (chrono::Utc::now() - state.started_at).num_seconds();
    let rooms = state.routing.room_count().await;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "instanceId": state.instance_id,
        "apiPort": state.settings.app.port,
        "signalingPort": state.settings.server.signaling_port,
        "uptimeSecs": uptime_secs,
        "rooms": rooms,
        "workers": state.worker_pool.worker_count(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.rooms.set(state.routing.room_count().await as i64);
    state
        .metrics
        .workers_live
        .set(state.worker_pool.live_count() as i64);

    let body = state.metrics.export();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
