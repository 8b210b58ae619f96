//! Payment request endpoints.

use alloy::primitives::{Address, U256};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::time::Duration;
use tracing::instrument;

use crate::api::handlers::admin::require_admin;
use crate::api::middleware::error::ApiError;
use crate::api::models::{CreateRequestBody, CreatedRequestResponse, PaymentRequestResponse};
use crate::app_state::AppState;
use crate::db::models::{u256_from_db, PaymentKind};
use crate::payments;

#[utoipa::path(
    get,
    path = "/payments/requests/{id}",
    params(
        ("id" = String, Path, description = "Request id")
    ),
    responses(
        (status = 200, description = "Current request state", body = PaymentRequestResponse),
        (status = 404, description = "Unknown request")
    ),
    tag = "Payments"
)]
/// Returns a payment request's current state.
#[instrument(skip(state))]
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PaymentRequestResponse>, ApiError> {
    let row = state
        .repository
        .get_payment_request(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("request {id} not found")))?;

    Ok(Json(PaymentRequestResponse {
        id: row.id,
        player_id: row.player_id,
        kind: row.kind,
        status: row.status,
        from_wallet: row.from_wallet,
        expected_amount_wei: u256_from_db(&row.expected_amount_wei)?.to_string(),
        unique_amount_wei: u256_from_db(&row.unique_amount_wei)?.to_string(),
        expires_at: row.expires_at,
        created_at: row.created_at,
        matched_tx_hash: row.matched_tx_hash,
        matched_at: row.matched_at,
    }))
}

#[utoipa::path(
    post,
    path = "/payments/requests",
    request_body = CreateRequestBody,
    responses(
        (status = 200, description = "Request created", body = CreatedRequestResponse),
        (status = 400, description = "Malformed body"),
        (status = 401, description = "Missing admin token")
    ),
    tag = "Payments"
)]
/// Creates a payment request with a perturbed unique amount.
///
/// Internal API used by the command layer, which instructs the player to
/// send exactly `unique_amount_wei` before `expires_at`.
#[instrument(skip(state, headers, body))]
pub async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequestBody>,
) -> Result<Json<CreatedRequestResponse>, ApiError> {
    require_admin(&state, &headers)?;

    let kind = PaymentKind::parse(&body.kind)
        .map_err(|_| ApiError::BadRequest(format!("unknown payment kind: {}", body.kind)))?;
    let expected = U256::from_str_radix(&body.expected_amount_wei, 10).map_err(|_| {
        ApiError::BadRequest(format!(
            "expected_amount_wei is not a decimal number: {}",
            body.expected_amount_wei
        ))
    })?;
    let from_wallet = match &body.from_wallet {
        Some(text) => Some(text.parse::<Address>().map_err(|_| {
            ApiError::BadRequest(format!("malformed from_wallet: {text}"))
        })?),
        None => None,
    };

    let created = payments::create_request(
        &state.repository,
        &body.player_id,
        kind,
        expected,
        from_wallet,
        Duration::from_secs(body.ttl_secs),
    )
    .await?;

    Ok(Json(CreatedRequestResponse {
        id: created.id,
        unique_amount_wei: created.unique_amount.to_string(),
        expires_at: created.expires_at,
    }))
}
