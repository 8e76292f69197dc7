//! Run submission, status read-back and position snapshot endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{parse_timestamp, Position, PositionSnapshot, Run, RunStatus, RunTask, RunType};
use crate::orchestrator::SubmitRunRequest;
use crate::run_state;

use super::{ApiError, AppState};

const LIST_LIMIT_DEFAULT: usize = 50;
const LIST_LIMIT_MAX: usize = 500;

#[derive(Debug, Deserialize)]
pub struct PortfolioScopeBody {
    pub node_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRefBody {
    pub scenario_set_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionBody {
    pub hash_mod: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRunBody {
    #[serde(default)]
    pub run_id: Option<String>,
    pub run_type: String,
    pub as_of_time: String,
    pub market_snapshot_id: String,
    pub portfolio_scope: PortfolioScopeBody,
    pub measures: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioRefBody>,
    #[serde(default)]
    pub execution: Option<ExecutionBody>,
}

#[derive(Debug, Serialize)]
pub struct SubmitRunResponse {
    pub run_id: String,
    pub status: &'static str,
    pub task_count: usize,
}

/// `POST /api/v1/runs`
pub async fn submit_run(
    State(state): State<AppState>,
    Json(body): Json<SubmitRunBody>,
) -> Result<(StatusCode, Json<SubmitRunResponse>), ApiError> {
    let run_type = RunType::parse(&body.run_type).ok_or_else(|| {
        ApiError::bad_request("run_type must be EOD_OFFICIAL, INTRADAY or SANDBOX")
    })?;
    let as_of_time = parse_timestamp(&body.as_of_time)
        .ok_or_else(|| ApiError::bad_request("as_of_time must be RFC 3339 with an offset"))?;

    let request = SubmitRunRequest {
        run_id: body.run_id,
        run_type,
        as_of_time,
        market_snapshot_id: body.market_snapshot_id,
        portfolio_scope: body.portfolio_scope.node_ids,
        measures: body.measures,
        scenarios: body.scenarios.into_iter().map(|s| s.scenario_set_id).collect(),
        hash_mod: body.execution.and_then(|e| e.hash_mod),
    };
    let submitted = state.orchestrator.submit_run(&request)?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitRunResponse {
            run_id: submitted.run_id,
            status: "QUEUED",
            task_count: submitted.task_count,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    pub task_counts: BTreeMap<String, i64>,
}

/// `GET /api/v1/runs/{run_id}`
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunView>, ApiError> {
    let run = run_state::get_run(&state.db, &run_id)?;
    let task_counts = run_state::run_task_counts(&state.db, &run_id)?
        .into_iter()
        .map(|(status, n)| (status.as_str().to_string(), n))
        .collect();
    Ok(Json(RunView { run, task_counts }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
    pub count: usize,
}

/// `GET /api/v1/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListRunsResponse>, ApiError> {
    let status = match &query.status {
        Some(s) => Some(
            RunStatus::parse(s).ok_or_else(|| ApiError::bad_request("unknown status filter"))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(LIST_LIMIT_DEFAULT).min(LIST_LIMIT_MAX);
    let runs = run_state::list_runs(&state.db, status, limit)?;
    Ok(Json(ListRunsResponse { count: runs.len(), runs }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub status: String,
    pub transitioned: bool,
}

/// `POST /api/v1/runs/{run_id}:cancel`
///
/// The router hands the whole final segment over; anything other than a
/// `:cancel` suffix is an unknown action.
pub async fn run_action(
    State(state): State<AppState>,
    Path(segment): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let run_id = segment
        .strip_suffix(":cancel")
        .ok_or_else(|| ApiError::not_found(format!("unknown run action: {}", segment)))?;
    let transitioned = run_state::request_cancel(&state.db, run_id)?;
    let run = run_state::get_run(&state.db, run_id)?;
    Ok(Json(CancelResponse {
        run_id: run_id.to_string(),
        status: run.status.as_str().to_string(),
        transitioned,
    }))
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub run_id: String,
    pub tasks: Vec<RunTask>,
}

/// `GET /api/v1/runs/{run_id}/tasks`
pub async fn list_tasks(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<TaskListResponse>, ApiError> {
    run_state::get_run(&state.db, &run_id)?;
    let tasks = state.queue.tasks_for_run(&run_id)?;
    Ok(Json(TaskListResponse { run_id, tasks }))
}

#[derive(Debug, Deserialize)]
pub struct PositionSnapshotBody {
    pub portfolio_node_id: String,
    pub as_of_time: String,
    pub positions: Vec<Position>,
}

#[derive(Debug, Serialize)]
pub struct PositionSnapshotResponse {
    pub position_snapshot_id: String,
    pub payload_hash: String,
    pub deduplicated: bool,
}

/// `POST /api/v1/position-snapshots`
pub async fn put_position_snapshot(
    State(state): State<AppState>,
    Json(body): Json<PositionSnapshotBody>,
) -> Result<(StatusCode, Json<PositionSnapshotResponse>), ApiError> {
    if body.portfolio_node_id.trim().is_empty() {
        return Err(ApiError::bad_request("portfolio_node_id must not be empty"));
    }
    let as_of_time = parse_timestamp(&body.as_of_time)
        .ok_or_else(|| ApiError::bad_request("as_of_time must be RFC 3339 with an offset"))?;
    let outcome =
        state.snapshots.put_position_snapshot(&body.portfolio_node_id, as_of_time, &body.positions)?;
    let status = if outcome.deduplicated { StatusCode::OK } else { StatusCode::CREATED };
    Ok((
        status,
        Json(PositionSnapshotResponse {
            position_snapshot_id: outcome.position_snapshot_id,
            payload_hash: outcome.payload_hash,
            deduplicated: outcome.deduplicated,
        }),
    ))
}

/// `GET /api/v1/position-snapshots/{id}`
pub async fn get_position_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PositionSnapshot>, ApiError> {
    Ok(Json(state.snapshots.get_position_snapshot(&id)?))
}
