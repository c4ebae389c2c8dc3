//! API route handlers.
//!
//! State is the shared `Arc<Orchestrator>`; every handler goes through it
//! so the admin endpoints take the same code path as the cadence loop.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::engine::Orchestrator;
use crate::params::ChampionConfig;
use crate::storage::ControlState;
use crate::types::{Adjustment, CanaryError, PerformanceSnapshot, RecommendationRecord};

pub type AppState = Arc<Orchestrator>;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReasonBody {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
}

/// Maps domain errors onto HTTP status codes.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<CanaryError>() {
            Some(CanaryError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(CanaryError::InvalidState(_)) => StatusCode::CONFLICT,
            Some(CanaryError::Validation(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "API request failed");
        } else {
            warn!(status = %status, error = %self.0, "API request refused");
        }
        let body = serde_json::json!({ "error": format!("{:#}", self.0) });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/champion
pub async fn get_champion(State(orch): State<AppState>) -> Json<ChampionConfig> {
    Json(orch.champion().await.as_ref().clone())
}

/// GET /api/recommendations?limit=N
pub async fn get_recommendations(
    State(orch): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<RecommendationRecord>>, ApiError> {
    Ok(Json(orch.recent_recommendations(params.limit()).await?))
}

/// GET /api/adjustments?limit=N
pub async fn get_adjustments(
    State(orch): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Adjustment>>, ApiError> {
    Ok(Json(orch.recent_adjustments(params.limit()).await?))
}

/// GET /api/snapshots
pub async fn get_snapshots(State(orch): State<AppState>) -> Result<Json<Vec<PerformanceSnapshot>>, ApiError> {
    Ok(Json(orch.snapshots().await?))
}

/// GET /api/control
pub async fn get_control(State(orch): State<AppState>) -> Json<ControlState> {
    Json(orch.control().await)
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

/// POST /api/admin/force-apply/:id
pub async fn force_apply(State(orch): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Adjustment>, ApiError> {
    Ok(Json(orch.force_apply(id, Utc::now()).await?))
}

/// POST /api/admin/rollback/:id  (optional body `{"reason": "..."}`)
pub async fn rollback(
    State(orch): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReasonBody>>,
) -> Result<Json<Adjustment>, ApiError> {
    let reason = body
        .map(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual rollback".to_string());
    Ok(Json(orch.rollback(id, &reason, Utc::now()).await?))
}

/// POST /api/admin/emergency-stop  (body `{"reason": "..."}`)
pub async fn emergency_stop(
    State(orch): State<AppState>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<Ack>, ApiError> {
    if body.reason.trim().is_empty() {
        return Err(anyhow::Error::from(CanaryError::Validation("emergency stop needs a reason".to_string())).into());
    }
    orch.emergency_stop(body.reason.trim(), Utc::now()).await;
    Ok(Json(Ack { ok: true }))
}

/// POST /api/admin/resume
pub async fn resume(State(orch): State<AppState>) -> Json<Ack> {
    orch.resume(Utc::now()).await;
    Json(Ack { ok: true })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
