//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, CadenceError>` so that
//! errors are converted to HTTP status codes by the `IntoResponse`
//! implementation on `CadenceError`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResponse, AppState, USER_ID_HEADER};
use crate::error::{CadenceError, Result};
use crate::jobs::{
    next_fire_time, InvocationId, JobInvocation, NewSchedule, ScheduleDefinition, ScheduleId, SchedulePatch,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "jobs": state.registry.names(),
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(|handle| handle.render()).unwrap_or_default();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// A schedule plus the next instant it would fire.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: ScheduleDefinition,
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl ScheduleView {
    fn at(schedule: ScheduleDefinition, now: DateTime<Utc>) -> Self {
        let next_fire_at = next_fire_time(&schedule, now).unwrap_or_else(|e| {
            tracing::warn!(schedule_id = %schedule.id, error = %e, "Cannot compute next fire time");
            None
        });
        Self { schedule, next_fire_at }
    }
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewSchedule>,
) -> Result<impl IntoResponse> {
    state.registry.ensure_registered(&req.job_name)?;

    let schedule = state.schedules.create(req, user_id(&headers)).await?;
    let view = ScheduleView::at(schedule, Utc::now());

    Ok((StatusCode::CREATED, Json(ApiResponse::success(view))))
}

pub async fn list_schedules(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let now = Utc::now();
    let views: Vec<ScheduleView> = state
        .schedules
        .list_all()
        .await?
        .into_iter()
        .map(|schedule| ScheduleView::at(schedule, now))
        .collect();

    Ok(Json(ApiResponse::success(views)))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let id = ScheduleId(id);
    let schedule = state
        .schedules
        .get(id)
        .await?
        .ok_or_else(|| CadenceError::schedule_not_found(id))?;

    Ok(Json(ApiResponse::success(ScheduleView::at(schedule, Utc::now()))))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<SchedulePatch>,
) -> Result<impl IntoResponse> {
    if patch.is_empty() {
        return Err(CadenceError::validation("Update must change at least one field"));
    }
    if let Some(job_name) = &patch.job_name {
        state.registry.ensure_registered(job_name)?;
    }

    let schedule = state.schedules.update(ScheduleId(id), patch).await?;
    Ok(Json(ApiResponse::success(ScheduleView::at(schedule, Utc::now()))))
}

/// `DELETE` disables; the record and its run history stay.
pub async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let id = ScheduleId(id);
    state.schedules.disable(id).await?;
    let schedule = state
        .schedules
        .get(id)
        .await?
        .ok_or_else(|| CadenceError::schedule_not_found(id))?;

    Ok(Json(ApiResponse::success(ScheduleView::at(schedule, Utc::now()))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invocation Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitInvocationRequest {
    pub job_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Run no earlier than this instant
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Run no earlier than this many seconds from now
    #[serde(default)]
    pub countdown_secs: Option<u64>,
}

impl SubmitInvocationRequest {
    fn eta(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match (self.eta, self.countdown_secs) {
            (Some(_), Some(_)) => Err(CadenceError::validation("eta and countdown_secs are mutually exclusive")),
            (Some(eta), None) => Ok(Some(eta)),
            (None, Some(secs)) => i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|delay| now.checked_add_signed(delay))
                .map(Some)
                .ok_or_else(|| CadenceError::validation("countdown_secs is too large")),
            (None, None) => Ok(None),
        }
    }
}

pub async fn submit_invocation(
    State(state): State<AppState>,
    Json(req): Json<SubmitInvocationRequest>,
) -> Result<impl IntoResponse> {
    let now = Utc::now();
    let id = match req.eta(now)? {
        Some(eta) => {
            state
                .dispatcher
                .submit_delayed_at(&req.job_name, req.args, eta, now)
                .await?
        }
        None => state.dispatcher.submit(&req.job_name, req.args).await?,
    };

    let invocation = fetch_invocation(&state, id).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(invocation))))
}

/// Returns the invocation in whatever state it is; 404 only for unknown ids.
pub async fn get_invocation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let invocation = fetch_invocation(&state, InvocationId(id)).await?;
    Ok(Json(ApiResponse::success(invocation)))
}

pub async fn cancel_invocation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let invocation = state.results.cancel(InvocationId(id), Utc::now()).await?;
    tracing::info!(invocation_id = %invocation.id, "Invocation cancelled");
    Ok(Json(ApiResponse::success(invocation)))
}

async fn fetch_invocation(state: &AppState, id: InvocationId) -> Result<JobInvocation> {
    state
        .results
        .get(id)
        .await?
        .ok_or_else(|| CadenceError::invocation_not_found(id))
}
