//! V1 API routes.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::{handlers, AppState};

/// V1 API prefix.
pub const V1_PREFIX: &str = "/api/v1";

/// Build the V1 API router.
///
/// All routes are mounted under `/api/v1/`.
///
/// # Endpoints
///
/// ## Schedules
/// - `POST /api/v1/schedules` - Create a schedule
/// - `GET /api/v1/schedules` - List all schedules
/// - `GET /api/v1/schedules/:id` - Get a schedule with its next fire time
/// - `PUT /api/v1/schedules/:id` - Update a schedule
/// - `DELETE /api/v1/schedules/:id` - Disable a schedule
///
/// ## Invocations
/// - `POST /api/v1/invocations` - Submit a job now or after a delay
/// - `GET /api/v1/invocations/:id` - Poll an invocation
/// - `POST /api/v1/invocations/:id/cancel` - Cancel a pending invocation
pub fn v1_router() -> Router<AppState> {
    Router::new()
        // Schedule endpoints
        .route(
            "/schedules",
            post(handlers::create_schedule).get(handlers::list_schedules),
        )
        .route(
            "/schedules/:id",
            get(handlers::get_schedule)
                .put(handlers::update_schedule)
                .delete(handlers::disable_schedule),
        )
        // Invocation endpoints
        .route("/invocations", post(handlers::submit_invocation))
        .route("/invocations/:id", get(handlers::get_invocation))
        .route("/invocations/:id/cancel", post(handlers::cancel_invocation))
}

/// V1 API route constants for use in clients and documentation.
pub mod paths {
    pub const SCHEDULES: &str = "/api/v1/schedules";
    pub const SCHEDULE: &str = "/api/v1/schedules/:id";

    pub const INVOCATIONS: &str = "/api/v1/invocations";
    pub const INVOCATION: &str = "/api/v1/invocations/:id";
    pub const INVOCATION_CANCEL: &str = "/api/v1/invocations/:id/cancel";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_constants() {
        assert!(paths::SCHEDULES.starts_with(V1_PREFIX));
        assert!(paths::INVOCATIONS.starts_with(V1_PREFIX));
        assert!(paths::INVOCATION_CANCEL.ends_with("/cancel"));
    }
}
