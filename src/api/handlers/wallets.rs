//! Wallet staking endpoints.

use alloy::primitives::Address;
use axum::{
    extract::{Path, State},
    Json,
};
use tracing::instrument;

use crate::api::middleware::error::ApiError;
use crate::api::models::StakeResponse;
use crate::app_state::AppState;

#[utoipa::path(
    get,
    path = "/wallets/{address}/stakes",
    params(
        ("address" = String, Path, description = "Wallet address")
    ),
    responses(
        (status = 200, description = "The wallet's staking positions", body = [StakeResponse]),
        (status = 400, description = "Malformed address")
    ),
    tag = "Wallets"
)]
/// Returns every staking position held by a wallet.
#[instrument(skip(state))]
pub async fn get_wallet_stakes(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<StakeResponse>>, ApiError> {
    let address = address
        .parse::<Address>()
        .map_err(|_| ApiError::BadRequest(format!("malformed address: {address}")))?;
    let wallet_key = format!("{address:?}").to_lowercase();

    let rows = state.repository.stakes_for_wallet(&wallet_key).await?;

    let mut stakes = Vec::with_capacity(rows.len());
    for row in rows {
        stakes.push(StakeResponse {
            chain_id: row.chain_id,
            pool_id: row.pool_id,
            wallet: row.wallet.clone(),
            lp_amount_wei: row.lp_amount_wei()?.to_string(),
            v1_amount_wei: row.v1_amount_wei()?.to_string(),
            v2_amount_wei: row.v2_amount_wei()?.to_string(),
            updated_at: row.updated_at,
        });
    }

    Ok(Json(stakes))
}
