//! Main axum router and HTTP request handlers for the node.
//!
//! Routes:
//! - `GET  /healthz`                - Health check
//! - `GET  /metrics`                - Prometheus metrics
//! - `GET  /api/v1/cluster/config`  - Current cluster topology snapshot
//! - `GET  /api/v1/peers`           - Peers announced in the shared store
//! - `GET  /api/v1/gc`              - Per-task GC statistics
//! - `POST /api/v1/gc/{task}/run`   - Trigger one GC task now

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::gc::{GcError, TaskStats};
use crate::server::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/api/v1/cluster/config", get(handle_cluster_config))
        .route("/api/v1/peers", get(handle_peers))
        .route("/api/v1/gc", get(handle_gc_stats))
        .route("/api/v1/gc/{task}/run", post(handle_gc_run))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PeersResponse {
    count: usize,
    peers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GcRunResponse {
    task: String,
    /// `false` when the trigger was skipped because a run was in flight.
    ran: bool,
    stats: TaskStats,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/v1/cluster/config`
///
/// Serves the current snapshot, refreshing first if it has expired.  Only
/// fails when nothing has ever been resolved.
async fn handle_cluster_config(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let snapshot = state
        .dynconfig
        .resolve()
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;
    Ok(Json(snapshot.as_ref()).into_response())
}

/// `GET /api/v1/peers`
#[instrument(skip(state))]
async fn handle_peers(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let registry = state
        .peers
        .as_ref()
        .ok_or_else(|| AppError::NotFound("no shared store configured".into()))?;

    let peers = registry.list_peers().await.map_err(|e| {
        warn!(error = %format!("{e:#}"), "peer scan failed");
        AppError::Unavailable("peer list currently unknown".into())
    })?;

    Ok(Json(PeersResponse {
        count: peers.len(),
        peers,
    })
    .into_response())
}

/// `GET /api/v1/gc`
async fn handle_gc_stats(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, TaskStats>> {
    let stats = state
        .gc
        .task_ids()
        .into_iter()
        .filter_map(|id| state.gc.stats(&id).map(|s| (id, s)))
        .collect();
    Json(stats)
}

/// `POST /api/v1/gc/{task}/run`
///
/// Runs the task and waits for it to finish.  A task already running is not
/// queued; the response reports `ran: false` instead.
#[instrument(skip(state), fields(%task))]
async fn handle_gc_run(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Response, AppError> {
    let ran = state.gc.run(&task).await.map_err(|e| match e {
        GcError::UnknownTask(_) => AppError::NotFound(e.to_string()),
        GcError::Stopped => AppError::Unavailable(e.to_string()),
        GcError::DuplicateTask(_) | GcError::InvalidSchedule(_) => AppError::Internal(e.into()),
    })?;
    info!(ran, "manual gc trigger");

    let stats = state.gc.stats(&task).unwrap_or_default();
    Ok(Json(GcRunResponse { task, ran, stats }).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        dynconfig: Arc::clone(&state.dynconfig),
        keepalive: state.keepalive.clone(),
        store: state.peers.as_ref().map(|p| Arc::clone(p.store())),
    };
    crate::health::health_handler(State(health_state))
        .await
        .into_response()
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that maps to an HTTP response.
#[derive(Debug)]
pub enum AppError {
    /// The requested resource does not exist on this node.
    NotFound(String),
    /// A dependency is currently unreachable; the caller may retry.
    Unavailable(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
