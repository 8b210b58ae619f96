//! Health check endpoint.

use axum::{extract::State, Json};
use std::time::SystemTime;
use tracing::instrument;

use crate::api::middleware::error::ApiError;
use crate::api::models::HealthResponse;
use crate::app_state::AppState;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "Health"
)]
/// Returns service health information.
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let uptime = SystemTime::now()
        .duration_since(state.start_time)
        .unwrap_or_default()
        .as_secs();

    let (db_status, status) = match state.repository.health_check().await {
        Ok(()) => ("healthy", "healthy"),
        Err(_) => ("unhealthy", "degraded"),
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        database_status: db_status.to_string(),
        indexers: state.scheduler.snapshots().len(),
    }))
}
