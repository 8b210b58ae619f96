//! Admin lifecycle endpoints for indexer tasks.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use tracing::{info, instrument};

use crate::api::middleware::error::ApiError;
use crate::api::models::AdminActionResponse;
use crate::app_state::AppState;

/// Check the bearer token on an admin-gated request.
///
/// # Errors
///
/// `Unauthorized` when a token is configured and the header is missing or
/// wrong. With no token configured the gate is open (dev instances).
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[utoipa::path(
    post,
    path = "/admin/indexers/{name}/{action}",
    params(
        ("name" = String, Path, description = "Task name, e.g. dfkchain/pool_staking_v2"),
        ("action" = String, Path, description = "start, stop or reset")
    ),
    responses(
        (status = 200, description = "Action applied (idempotent)", body = AdminActionResponse),
        (status = 400, description = "Unknown action"),
        (status = 401, description = "Missing admin token"),
        (status = 404, description = "Unknown task")
    ),
    tag = "Admin"
)]
/// Starts, stops or resets an indexer task. Idempotent.
#[instrument(skip(state, headers))]
pub async fn indexer_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((name, action)): Path<(String, String)>,
) -> Result<Json<AdminActionResponse>, ApiError> {
    require_admin(&state, &headers)?;

    let applied = match action.as_str() {
        "start" => state.scheduler.start_task(&name),
        "stop" => state.scheduler.stop_task(&name),
        "reset" => state.scheduler.reset_task(&name).await?,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown action: {other} (expected start, stop or reset)"
            )))
        }
    };

    if !applied {
        return Err(ApiError::NotFound(format!("no task named {name}")));
    }

    info!(task = %name, action = %action, "Admin action applied");
    Ok(Json(AdminActionResponse {
        task: name,
        action,
        applied,
    }))
}
