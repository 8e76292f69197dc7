//! Boundary services.
//!
//! Thin HTTP adapters over the snapshot store, the orchestrator, and the
//! run/task read paths. Handlers validate request shape, delegate, and map
//! store errors onto status codes; no business logic lives here.

pub mod marketdata;
pub mod runs;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::Database;
use crate::orchestrator::{Orchestrator, RunDefaults, SubmitError};
use crate::queue::{QueueError, TaskQueue};
use crate::run_state::RunStateError;
use crate::snapshot_store::{SnapshotStore, SnapshotStoreError};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub snapshots: SnapshotStore,
    pub orchestrator: Orchestrator,
    pub queue: TaskQueue,
}

impl AppState {
    pub fn new(db: Database, defaults: RunDefaults) -> Self {
        let snapshots = SnapshotStore::new(db.clone());
        Self {
            orchestrator: Orchestrator::new(db.clone(), snapshots.clone(), defaults),
            queue: TaskQueue::new(db.clone()),
            snapshots,
            db,
        }
    }
}

/// Error envelope: `{"error": "..."}` with the mapped status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SnapshotStoreError> for ApiError {
    fn from(e: SnapshotStoreError) -> Self {
        let status = match &e {
            SnapshotStoreError::NotFound(_) => StatusCode::NOT_FOUND,
            SnapshotStoreError::Conflict(_) => StatusCode::CONFLICT,
            SnapshotStoreError::Hash(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: e.to_string() }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match &e {
            SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
            SubmitError::UnknownSnapshot(_) => StatusCode::NOT_FOUND,
            SubmitError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: e.to_string() }
    }
}

impl From<RunStateError> for ApiError {
    fn from(e: RunStateError) -> Self {
        let status = match &e {
            RunStateError::UnknownRun(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: e.to_string() }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self::internal(e.to_string())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Snapshot ingest service.
pub fn ingest_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/marketdata/snapshots", post(marketdata::put_market_snapshot))
        .route("/api/v1/marketdata/snapshots/:snapshot_id", get(marketdata::get_market_snapshot))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Orchestrator service: run submission, status read-back, position
/// snapshot ingest.
pub fn orchestrator_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runs", post(runs::submit_run).get(runs::list_runs))
        // POST /api/v1/runs/{run_id}:cancel - the verb rides in the final
        // path segment, split off in the handler.
        .route("/api/v1/runs/:run_id", get(runs::get_run).post(runs::run_action))
        .route("/api/v1/runs/:run_id/tasks", get(runs::list_tasks))
        .route("/api/v1/position-snapshots", post(runs::put_position_snapshot))
        .route("/api/v1/position-snapshots/:id", get(runs::get_position_snapshot))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
