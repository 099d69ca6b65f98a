//! HTTP API for Cadence.
//!
//! Unversioned endpoints:
//! - `GET /health`
//! - `GET /metrics` (Prometheus text format)
//!
//! Everything else lives under `/api/v1`, see [`v1::routes`].

mod handlers;
pub mod v1;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::jobs::{Dispatcher, JobRegistry, ResultStore, ScheduleStore};

pub use handlers::{ScheduleView, SubmitInvocationRequest};

/// Header carrying the caller's user id, recorded as `created_by`.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub schedules: Arc<dyn ScheduleStore>,
    pub results: Arc<dyn ResultStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<JobRegistry>,
    /// Absent when no recorder is installed (tests)
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router.
///
/// ```rust,ignore
/// let app = build_router(state);
/// axum::serve(listener, app).await?;
/// ```
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest(v1::V1_PREFIX, v1::v1_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}
