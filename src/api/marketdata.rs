//! Market data ingest endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::market::MarketPayload;
use crate::models::{parse_timestamp, DqStatus, MarketSnapshot};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct MarketSnapshotRequest {
    pub snapshot_id: String,
    pub as_of_time: String,
    pub vendor: String,
    pub universe_id: String,
    pub payload: MarketPayload,
    pub dq_status: String,
}

#[derive(Debug, Serialize)]
pub struct MarketSnapshotResponse {
    pub snapshot_id: String,
    pub payload_hash: String,
}

/// `POST /api/v1/marketdata/snapshots`
pub async fn put_market_snapshot(
    State(state): State<AppState>,
    Json(request): Json<MarketSnapshotRequest>,
) -> Result<(StatusCode, Json<MarketSnapshotResponse>), ApiError> {
    if request.snapshot_id.trim().is_empty() {
        return Err(ApiError::bad_request("snapshot_id must not be empty"));
    }
    let as_of_time = parse_timestamp(&request.as_of_time)
        .ok_or_else(|| ApiError::bad_request("as_of_time must be RFC 3339 with an offset"))?;
    let dq_status = DqStatus::parse(&request.dq_status)
        .ok_or_else(|| ApiError::bad_request("dq_status must be PASS, WARN or FAIL"))?;
    if let Some(bad) = first_non_finite(&request.payload) {
        return Err(ApiError::bad_request(format!("non-finite rate in payload: {}", bad)));
    }

    let payload_hash = state.snapshots.put_market_snapshot(
        &request.snapshot_id,
        as_of_time,
        &request.vendor,
        &request.universe_id,
        &request.payload,
        dq_status,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(MarketSnapshotResponse { snapshot_id: request.snapshot_id, payload_hash }),
    ))
}

/// `GET /api/v1/marketdata/snapshots/{snapshot_id}`
pub async fn get_market_snapshot(
    State(state): State<AppState>,
    Path(snapshot_id): Path<String>,
) -> Result<Json<MarketSnapshot>, ApiError> {
    Ok(Json(state.snapshots.get_market_snapshot(&snapshot_id)?))
}

fn first_non_finite(payload: &MarketPayload) -> Option<String> {
    for curve in &payload.curves {
        for node in &curve.nodes {
            if !node.rate.is_finite() {
                return Some(format!("{}/{}", curve.id, node.tenor));
            }
        }
    }
    for spot in &payload.fx_spots {
        if !spot.rate.is_finite() {
            return Some(spot.pair.clone());
        }
    }
    None
}
