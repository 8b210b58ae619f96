//! TVL and per-pool valuation.
//!
//! For a `(chain, pool)` the engine combines three inputs:
//! - staked LP balances materialized from deposit/withdraw events,
//! - the LP contract's `totalSupply`/`getReserves`, fetched at the
//!   confirmed head and cached for 60 s,
//! - token USD prices from the price oracle.
//!
//! ```text
//! poolValue = reserve0 * price0 + reserve1 * price1
//! poolTvl   = (stakedLp / totalLp) * poolValue
//! ```
//!
//! V1 and V2 staked amounts for the same underlying LP are summed before
//! computing the share (the stake table folds both generations into one
//! row). A missing price on either side skips valuation for the pool: the
//! result reports `priced = false` with a zero TVL rather than a partial,
//! misleading USD value, and the persisted snapshot carries the miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy::primitives::{Address, U256};
use serde::Serialize;
use tracing::warn;

use crate::chain::{retry, ChainClient};
use crate::db::models::{u256_to_db, LpPoolStateRow};
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};
use crate::events::IUniswapV2Pair;
use crate::pricing::{display_units, PriceOracle};

/// On-chain call cache TTL.
const CALL_CACHE_TTL: Duration = Duration::from_secs(60);

/// Supply and reserves read from the LP contract.
#[derive(Debug, Clone, Copy)]
pub struct OnChainPoolState {
    /// LP token total supply in wei
    pub total_lp: U256,
    /// token0 reserve in wei
    pub reserve0: U256,
    /// token1 reserve in wei
    pub reserve1: U256,
}

/// A pool valuation result.
#[derive(Debug, Clone, Serialize)]
pub struct PoolTvl {
    /// Total USD value of staked LP (0 when unpriced)
    pub tvl_usd: f64,
    /// Fraction of the staked total held through V1, in [0, 1]
    pub v1_share: f64,
    /// Fraction of the staked total held through V2, in [0, 1]
    pub v2_share: f64,
    /// Valuation time (unix seconds)
    pub as_of: i64,
    /// Whether both sides had a price
    pub priced: bool,
    /// Why the pool is unpriced, when it is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Pure TVL computation over already-fetched inputs.
#[must_use]
#[allow(clippy::similar_names)]
pub fn compute_tvl(
    state: &OnChainPoolState,
    price0: f64,
    price1: f64,
    staked_total: U256,
    staked_v1: U256,
    staked_v2: U256,
    as_of: i64,
) -> PoolTvl {
    if state.total_lp.is_zero() {
        return PoolTvl {
            tvl_usd: 0.0,
            v1_share: 0.0,
            v2_share: 0.0,
            as_of,
            priced: true,
            reason: None,
        };
    }

    let pool_value = display_units(state.reserve0, 18) * price0
        + display_units(state.reserve1, 18) * price1;

    let total_lp = display_units(state.total_lp, 18);
    let mut staked = display_units(staked_total, 18);

    // Tracked stakes can exceed the reported supply by at most rounding
    // noise; anything beyond a wei is a reconstruction bug worth flagging.
    if staked_total > state.total_lp + U256::from(1u64) {
        warn!(
            staked = %staked_total,
            total_lp = %state.total_lp,
            "Tracked stakes exceed LP supply, clamping share"
        );
        staked = total_lp;
    }

    let share = (staked / total_lp).min(1.0);
    let tvl_usd = crate::db::models::round_usd(share * pool_value);

    let (v1_share, v2_share) = if staked_total.is_zero() {
        (0.0, 0.0)
    } else {
        let total = display_units(staked_total, 18);
        (
            display_units(staked_v1, 18) / total,
            display_units(staked_v2, 18) / total,
        )
    };

    PoolTvl {
        tvl_usd,
        v1_share,
        v2_share,
        as_of,
        priced: true,
        reason: None,
    }
}

/// The C8 engine; owns the per-pool on-chain call cache.
pub struct ValuationEngine {
    clients: HashMap<u64, Arc<ChainClient>>,
    repo: Arc<Repository>,
    oracle: Arc<PriceOracle>,
    call_cache: Mutex<HashMap<(u64, u64), (Instant, OnChainPoolState)>>,
}

impl ValuationEngine {
    /// Assemble the engine over the configured chains.
    #[must_use]
    pub fn new(
        clients: HashMap<u64, Arc<ChainClient>>,
        repo: Arc<Repository>,
        oracle: Arc<PriceOracle>,
    ) -> Self {
        Self {
            clients,
            repo,
            oracle,
            call_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Value one pool; see the module docs.
    ///
    /// # Errors
    ///
    /// Unknown pool, RPC exhaustion, or database failures. A missing token
    /// price is NOT an error: it reports `priced = false`.
    pub async fn pool_tvl(&self, chain_id: u64, pool_id: u64) -> LedgerResult<PoolTvl> {
        let descriptor = self
            .repo
            .get_pool_descriptor(chain_id, pool_id)
            .await?
            .ok_or_else(|| {
                LedgerError::state(format!("unknown pool {pool_id} on chain {chain_id}"), None)
            })?;

        let state = self.pool_state(chain_id, pool_id, &descriptor.lp_token).await?;
        let as_of = chrono::Utc::now().timestamp();

        let price0 = self.side_price(chain_id, &descriptor.token0).await?;
        let price1 = self.side_price(chain_id, &descriptor.token1).await?;

        // Persist the snapshot either way; the DEX-derived price graph
        // feeds on these rows.
        self.repo
            .insert_lp_pool_state(&LpPoolStateRow {
                chain_id: i64::try_from(chain_id).unwrap_or(i64::MAX),
                pool_id: i64::try_from(pool_id).unwrap_or(i64::MAX),
                as_of,
                total_lp: u256_to_db(state.total_lp),
                reserve0: u256_to_db(state.reserve0),
                reserve1: u256_to_db(state.reserve1),
                token0_price_usd: price0,
                token1_price_usd: price1,
            })
            .await?;

        let missing = match (price0, price1) {
            (None, _) => Some("missing price token0"),
            (_, None) => Some("missing price token1"),
            _ => None,
        };
        if let Some(reason) = missing {
            return Ok(PoolTvl {
                tvl_usd: 0.0,
                v1_share: 0.0,
                v2_share: 0.0,
                as_of,
                priced: false,
                reason: Some(reason.to_string()),
            });
        }

        let stakes = self.repo.stakes_for_pool(chain_id, pool_id).await?;
        let mut staked_total = U256::ZERO;
        let mut staked_v1 = U256::ZERO;
        let mut staked_v2 = U256::ZERO;
        for stake in &stakes {
            staked_total = staked_total.saturating_add(stake.lp_amount_wei()?);
            staked_v1 = staked_v1.saturating_add(stake.v1_amount_wei()?);
            staked_v2 = staked_v2.saturating_add(stake.v2_amount_wei()?);
        }

        Ok(compute_tvl(
            &state,
            price0.unwrap_or(0.0),
            price1.unwrap_or(0.0),
            staked_total,
            staked_v1,
            staked_v2,
            as_of,
        ))
    }

    /// Refresh persisted supply/reserve snapshots for every pool on a
    /// chain. Returns the number of pools refreshed.
    ///
    /// # Errors
    ///
    /// Database failures; individual RPC misses are skipped with a warning.
    pub async fn refresh_pool_states(&self, chain_id: u64) -> LedgerResult<usize> {
        let pools = self.repo.list_pool_descriptors(Some(chain_id)).await?;
        let as_of = chrono::Utc::now().timestamp();
        let mut refreshed = 0;

        for pool in pools {
            let pool_id = u64::try_from(pool.pool_id).unwrap_or(0);
            let state = match self.pool_state(chain_id, pool_id, &pool.lp_token).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(chain_id, pool_id, error = %e, "Pool state refresh failed, skipping");
                    continue;
                }
            };

            self.repo
                .insert_lp_pool_state(&LpPoolStateRow {
                    chain_id: pool.chain_id,
                    pool_id: pool.pool_id,
                    as_of,
                    total_lp: u256_to_db(state.total_lp),
                    reserve0: u256_to_db(state.reserve0),
                    reserve1: u256_to_db(state.reserve1),
                    token0_price_usd: None,
                    token1_price_usd: None,
                })
                .await?;
            refreshed += 1;
        }

        Ok(refreshed)
    }

    async fn side_price(&self, chain_id: u64, token: &str) -> LedgerResult<Option<f64>> {
        let Ok(address) = token.parse::<Address>() else {
            return Ok(None);
        };
        match self.oracle.price_usd(chain_id, address, None).await {
            Ok(quote) => Ok(Some(quote.price_usd)),
            Err(LedgerError::NoPrice { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch supply and reserves, with the 60 s call cache.
    async fn pool_state(
        &self,
        chain_id: u64,
        pool_id: u64,
        lp_token: &str,
    ) -> LedgerResult<OnChainPoolState> {
        if let Ok(cache) = self.call_cache.lock() {
            if let Some((at, state)) = cache.get(&(chain_id, pool_id)) {
                if at.elapsed() < CALL_CACHE_TTL {
                    return Ok(*state);
                }
            }
        }

        let client = self.clients.get(&chain_id).ok_or_else(|| {
            LedgerError::config(format!("no chain client for chain {chain_id}"), None)
        })?;
        let lp_address = lp_token.parse::<Address>().map_err(|e| {
            LedgerError::config(format!("invalid LP token address: {lp_token}"), Some(Box::new(e)))
        })?;

        let state = fetch_pool_state(client, lp_address).await?;

        if let Ok(mut cache) = self.call_cache.lock() {
            cache.insert((chain_id, pool_id), (Instant::now(), state));
        }
        Ok(state)
    }
}

/// Read `totalSupply` and `getReserves` through the chain client's
/// preferred endpoint, retrying transient failures.
async fn fetch_pool_state(
    client: &ChainClient,
    lp_address: Address,
) -> LedgerResult<OnChainPoolState> {
    let policy = retry::RetryPolicy::standard();
    let mut last_err = None;

    for attempt in 1..=3u32 {
        let provider = client.preferred_provider();
        let pair = IUniswapV2Pair::new(lp_address, provider);

        let result: Result<OnChainPoolState, String> = async {
            let supply = pair
                .totalSupply()
                .call()
                .await
                .map_err(|e| e.to_string())?;
            let reserves = pair.getReserves().call().await.map_err(|e| e.to_string())?;
            Ok(OnChainPoolState {
                total_lp: supply._0,
                reserve0: U256::from(reserves.reserve0),
                reserve1: U256::from(reserves.reserve1),
            })
        }
        .await;

        match result {
            Ok(state) => return Ok(state),
            Err(message) => {
                let err = retry::rpc_error("lp_pool_state", message);
                if !err.is_transient() {
                    return Err(err);
                }
                last_err = Some(err);
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        LedgerError::rpc_transient("lp_pool_state: retries exhausted", None)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wei(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[test]
    fn test_compute_tvl_basic() {
        let state = OnChainPoolState {
            total_lp: wei(1_000),
            reserve0: wei(500),
            reserve1: wei(1_250),
        };

        // Pool value: 500 * 2.0 + 1250 * 0.8 = 2000 USD. Half staked.
        let tvl = compute_tvl(&state, 2.0, 0.8, wei(500), wei(200), wei(300), 0);
        assert!(tvl.priced);
        assert!((tvl.tvl_usd - 1_000.0).abs() < 1e-6);
        assert!((tvl.v1_share - 0.4).abs() < 1e-9);
        assert!((tvl.v2_share - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_compute_tvl_zero_supply() {
        let state = OnChainPoolState {
            total_lp: U256::ZERO,
            reserve0: wei(500),
            reserve1: wei(1_250),
        };
        let tvl = compute_tvl(&state, 2.0, 0.8, U256::ZERO, U256::ZERO, U256::ZERO, 0);
        assert!(tvl.tvl_usd.abs() < f64::EPSILON);
    }

    #[test]
    fn test_compute_tvl_clamps_overstaked() {
        let state = OnChainPoolState {
            total_lp: wei(100),
            reserve0: wei(100),
            reserve1: wei(100),
        };
        // Tracked stakes above supply: share clamps to 1.
        let tvl = compute_tvl(&state, 1.0, 1.0, wei(150), wei(150), U256::ZERO, 0);
        assert!((tvl.tvl_usd - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_compute_tvl_no_stakes() {
        let state = OnChainPoolState {
            total_lp: wei(100),
            reserve0: wei(100),
            reserve1: wei(100),
        };
        let tvl = compute_tvl(&state, 1.0, 1.0, U256::ZERO, U256::ZERO, U256::ZERO, 0);
        assert!(tvl.tvl_usd.abs() < f64::EPSILON);
        assert!(tvl.v1_share.abs() < f64::EPSILON);
        assert!(tvl.v2_share.abs() < f64::EPSILON);
    }
}
