//! Pool valuation endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, instrument};

use crate::api::middleware::error::ApiError;
use crate::api::models::TvlResponse;
use crate::app_state::AppState;

#[utoipa::path(
    get,
    path = "/pools/{chain_id}/{pool_id}/tvl",
    params(
        ("chain_id" = u64, Path, description = "Chain id"),
        ("pool_id" = u64, Path, description = "Pool id within the master contract")
    ),
    responses(
        (status = 200, description = "Pool TVL", body = TvlResponse),
        (status = 404, description = "Unknown pool")
    ),
    tag = "Pools"
)]
/// Returns the USD value locked in a pool.
#[instrument(skip(state))]
pub async fn get_pool_tvl(
    State(state): State<AppState>,
    Path((chain_id, pool_id)): Path<(u64, u64)>,
) -> Result<Json<TvlResponse>, ApiError> {
    let tvl = state.valuation.pool_tvl(chain_id, pool_id).await?;

    info!(
        chain_id,
        pool_id,
        tvl_usd = tvl.tvl_usd,
        priced = tvl.priced,
        "Pool TVL computed"
    );

    Ok(Json(TvlResponse {
        tvl_usd: tvl.tvl_usd,
        v1_share: tvl.v1_share,
        v2_share: tvl.v2_share,
        as_of: tvl.as_of,
        priced: tvl.priced,
        reason: tvl.reason,
    }))
}
