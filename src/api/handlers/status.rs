//! Indexer status endpoint.

use axum::{extract::State, Json};
use tracing::instrument;

use crate::api::middleware::error::ApiError;
use crate::api::models::IndexerStatusResponse;
use crate::app_state::AppState;

#[utoipa::path(
    get,
    path = "/status/indexers",
    responses(
        (status = 200, description = "Status of every registered indexer", body = [IndexerStatusResponse])
    ),
    tag = "Status"
)]
/// Returns the live status of every registered indexer task.
#[instrument(skip(state))]
pub async fn list_indexers(
    State(state): State<AppState>,
) -> Result<Json<Vec<IndexerStatusResponse>>, ApiError> {
    let statuses = state
        .scheduler
        .snapshots()
        .into_iter()
        .map(IndexerStatusResponse::from)
        .collect();
    Ok(Json(statuses))
}
