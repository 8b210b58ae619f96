//! Bridge flow endpoints.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tracing::instrument;
use utoipa::IntoParams;

use crate::api::middleware::error::ApiError;
use crate::api::models::BridgeEventResponse;
use crate::app_state::AppState;
use crate::db::models::u256_from_db;

/// Query parameters for the bridge flow listing.
#[derive(Debug, Deserialize, IntoParams)]
pub struct BridgeQuery {
    /// Maximum rows to return (default 100, max 1000)
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[utoipa::path(
    get,
    path = "/bridge/events",
    params(BridgeQuery),
    responses(
        (status = 200, description = "Recent bridge transfers, newest first", body = [BridgeEventResponse])
    ),
    tag = "Bridge"
)]
/// Returns recent cross-chain transfers with their USD valuations.
#[instrument(skip(state))]
pub async fn list_bridge_events(
    State(state): State<AppState>,
    Query(query): Query<BridgeQuery>,
) -> Result<Json<Vec<BridgeEventResponse>>, ApiError> {
    let limit = query.limit.clamp(1, 1_000);
    let rows = state.repository.recent_bridge_events(limit).await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        events.push(BridgeEventResponse {
            chain_id: row.chain_id,
            tx_hash: row.tx_hash,
            direction: row.direction,
            wallet: row.wallet,
            token: row.token,
            amount_wei: u256_from_db(&row.amount_wei)?.to_string(),
            counterparty_chain_id: row.counterparty_chain_id,
            usd_value_at_event: row.usd_value_at_event,
            pricing_source: row.pricing_source,
            block_number: row.block_number,
            block_timestamp: row.block_timestamp,
        });
    }

    Ok(Json(events))
}
