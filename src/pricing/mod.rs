//! USD price resolution with provenance.
//!
//! [`PriceOracle::price_usd`] answers "USD price of token X on chain C at
//! time T" through a fixed priority chain:
//!
//! 1. In-memory cache (5 min TTL for live prices, infinite for historical)
//! 2. The authoritative off-chain API, tagged `DEFILLAMA`
//! 3. The secondary off-chain API, tagged `COINGECKO`
//! 4. Derivation from on-chain DEX reserves, tagged `DEX_DERIVED`
//! 5. The deprecation list, returning zero tagged `DEPRECATED`
//! 6. Otherwise a no-price error
//!
//! Every answer carries its source tag so downstream rows record
//! provenance. Resolved prices are also persisted to the price table,
//! which is what the ingestion path (bridge valuation) reads so it never
//! blocks on HTTP.
//!
//! # DEX derivation
//!
//! LP pairs form a graph over tokens. The graph is held as an arena of
//! integer-indexed nodes; a BFS finds the shortest path from the target
//! token to any priced numeraire (a configured stablecoin), and the price
//! is the product of reserve ratios along that path. Where several pairs
//! connect the same two tokens, the pair with the larger numeraire-side
//! liquidity wins.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use alloy::primitives::{Address, U256};
use tracing::{debug, warn};

use crate::db::models::{round_usd, u256_from_db, PricingSource, TokenPriceRow};
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};

pub mod sources;

use sources::{chain_slug, CoinGeckoSource, DefiLlamaSource, RemotePriceSource};

/// Live-cache TTL.
const LIVE_TTL_SECS: i64 = 300;

/// Convert a raw wei amount to display units.
///
/// Splits into whole and fractional parts before the float conversion so
/// amounts far above 2^53 wei keep their leading digits.
#[must_use]
pub fn display_units(amount: U256, decimals: u8) -> f64 {
    let divisor = U256::from(10u64).pow(U256::from(u64::from(decimals)));
    let whole = amount / divisor;
    let frac = amount % divisor;

    let whole_f = u128::try_from(whole).map_or(f64::MAX, |w| w as f64);
    let frac_f = u128::try_from(frac).map_or(0.0, |f| f as f64) / 10f64.powi(i32::from(decimals));
    whole_f + frac_f
}

/// A resolved price with provenance.
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    /// USD price, rounded to 6 fractional digits
    pub price_usd: f64,
    /// Which source produced the price
    pub source: PricingSource,
    /// Observation time (unix seconds)
    pub as_of: i64,
}

/// One side of an LP pair edge, reserves in display units.
#[derive(Debug, Clone, Copy)]
struct DexEdge {
    to: usize,
    reserve_here: f64,
    reserve_there: f64,
}

/// Arena-of-nodes token graph built from LP pairs.
#[derive(Debug, Default)]
struct DexGraph {
    index: HashMap<String, usize>,
    tokens: Vec<String>,
    adj: Vec<Vec<DexEdge>>,
}

impl DexGraph {
    fn intern(&mut self, token: &str) -> usize {
        if let Some(&idx) = self.index.get(token) {
            return idx;
        }
        let idx = self.tokens.len();
        self.tokens.push(token.to_string());
        self.index.insert(token.to_string(), idx);
        self.adj.push(Vec::new());
        idx
    }

    /// Add a pair, keeping only the deepest edge per direction.
    fn add_pair(&mut self, a: &str, b: &str, reserve_a: f64, reserve_b: f64) {
        if reserve_a <= 0.0 || reserve_b <= 0.0 {
            return;
        }
        let ia = self.intern(a);
        let ib = self.intern(b);
        Self::upsert_edge(&mut self.adj[ia], ia, ib, reserve_a, reserve_b);
        Self::upsert_edge(&mut self.adj[ib], ib, ia, reserve_b, reserve_a);
    }

    fn upsert_edge(
        edges: &mut Vec<DexEdge>,
        _from: usize,
        to: usize,
        reserve_here: f64,
        reserve_there: f64,
    ) {
        if let Some(existing) = edges.iter_mut().find(|e| e.to == to) {
            // Deeper far-side liquidity wins.
            if reserve_there > existing.reserve_there {
                *existing = DexEdge {
                    to,
                    reserve_here,
                    reserve_there,
                };
            }
        } else {
            edges.push(DexEdge {
                to,
                reserve_here,
                reserve_there,
            });
        }
    }

    /// BFS from `token` to the nearest priced numeraire, then fold reserve
    /// ratios along the path back to the token.
    fn derive(&self, token: &str, numeraire_prices: &HashMap<String, f64>) -> Option<f64> {
        let start = *self.index.get(token)?;
        if let Some(&price) = numeraire_prices.get(token) {
            return Some(price);
        }

        // parent[n] = (previous node, reserve at previous, reserve at n)
        let mut parent: Vec<Option<(usize, f64, f64)>> = vec![None; self.tokens.len()];
        let mut visited = vec![false; self.tokens.len()];
        let mut queue = VecDeque::new();

        visited[start] = true;
        queue.push_back(start);

        let mut goal = None;
        'search: while let Some(current) = queue.pop_front() {
            for edge in &self.adj[current] {
                if visited[edge.to] {
                    continue;
                }
                visited[edge.to] = true;
                parent[edge.to] = Some((current, edge.reserve_here, edge.reserve_there));

                if numeraire_prices.contains_key(&self.tokens[edge.to]) {
                    goal = Some(edge.to);
                    break 'search;
                }
                queue.push_back(edge.to);
            }
        }

        let goal = goal?;
        let mut price = *numeraire_prices.get(&self.tokens[goal])?;

        // Walk back from the numeraire to the target, repricing each hop:
        // price(prev) = price(here) * reserve(here) / reserve(prev).
        let mut node = goal;
        while node != start {
            let (prev, reserve_prev, reserve_here) = parent[node]?;
            if reserve_prev <= 0.0 {
                return None;
            }
            price = price * reserve_here / reserve_prev;
            node = prev;
        }

        Some(price)
    }
}

/// The priority-ordered price resolver; see the module docs.
pub struct PriceOracle {
    repo: Arc<Repository>,
    remotes: Vec<(PricingSource, Box<dyn RemotePriceSource>)>,
    stables: HashSet<String>,
    deprecated: HashSet<String>,
    live_cache: RwLock<HashMap<(u64, String), PriceQuote>>,
    historical_cache: RwLock<HashMap<(u64, String, i64), PriceQuote>>,
}

impl PriceOracle {
    /// Oracle against the public price APIs.
    #[must_use]
    pub fn new(repo: Arc<Repository>) -> Self {
        Self::with_remotes(
            repo,
            vec![
                (
                    PricingSource::Defillama,
                    Box::new(DefiLlamaSource::new()) as Box<dyn RemotePriceSource>,
                ),
                (
                    PricingSource::Coingecko,
                    Box::new(CoinGeckoSource::new()) as Box<dyn RemotePriceSource>,
                ),
            ],
        )
    }

    /// Oracle with injected remote sources (tests, alternative providers).
    #[must_use]
    pub fn with_remotes(
        repo: Arc<Repository>,
        remotes: Vec<(PricingSource, Box<dyn RemotePriceSource>)>,
    ) -> Self {
        Self {
            repo,
            remotes,
            stables: HashSet::new(),
            deprecated: HashSet::new(),
            live_cache: RwLock::new(HashMap::new()),
            historical_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Set the stablecoin numeraires used by DEX derivation.
    #[must_use]
    pub fn with_stables(mut self, stables: HashSet<String>) -> Self {
        self.stables = stables.into_iter().map(|s| s.to_lowercase()).collect();
        self
    }

    /// Set the deprecation list (tokens valued at zero).
    #[must_use]
    pub fn with_deprecated(mut self, deprecated: HashSet<String>) -> Self {
        self.deprecated = deprecated.into_iter().map(|s| s.to_lowercase()).collect();
        self
    }

    /// Resolve a USD price; see the module docs for the priority chain.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NoPrice`] when every source is exhausted; database
    /// failures from persistence.
    pub async fn price_usd(
        &self,
        chain_id: u64,
        token: Address,
        at: Option<i64>,
    ) -> LedgerResult<PriceQuote> {
        let token_key = format!("{token:?}").to_lowercase();
        let now = chrono::Utc::now().timestamp();

        // 1. Cache.
        if let Some(hit) = self.cache_get(chain_id, &token_key, at, now) {
            return Ok(hit);
        }

        // 2./3. Remote sources, in priority order. Transient failures fall
        // through to the next source rather than surfacing.
        let slug = chain_slug(chain_id);
        for (source, remote) in &self.remotes {
            match remote.fetch(slug, token, at).await {
                Ok(Some(price)) => {
                    let quote = PriceQuote {
                        price_usd: round_usd(price),
                        source: *source,
                        as_of: at.unwrap_or(now),
                    };
                    self.persist_and_cache(chain_id, &token_key, at, quote).await?;
                    return Ok(quote);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(source = source.as_str(), token = %token_key, error = %e, "Price source failed, falling through");
                }
            }
        }

        // 4. DEX reserves.
        if let Some(price) = self.dex_derived(chain_id, &token_key).await? {
            let quote = PriceQuote {
                price_usd: round_usd(price),
                source: PricingSource::DexDerived,
                as_of: at.unwrap_or(now),
            };
            self.persist_and_cache(chain_id, &token_key, at, quote).await?;
            return Ok(quote);
        }

        // 5. Deprecation list.
        if self.deprecated.contains(&token_key) {
            debug!(token = %token_key, "Token is deprecated, valuing at zero");
            let quote = PriceQuote {
                price_usd: 0.0,
                source: PricingSource::Deprecated,
                as_of: at.unwrap_or(now),
            };
            self.persist_and_cache(chain_id, &token_key, at, quote).await?;
            return Ok(quote);
        }

        Err(LedgerError::no_price(chain_id, token_key))
    }

    /// Warm the cache for every token referenced by a chain's pools.
    /// Returns the number of tokens successfully priced.
    ///
    /// # Errors
    ///
    /// Database failures; individual pricing misses are skipped.
    pub async fn warm_pool_tokens(&self, chain_id: u64) -> LedgerResult<usize> {
        let pools = self.repo.list_pool_descriptors(Some(chain_id)).await?;
        let mut tokens = HashSet::new();
        for pool in pools {
            tokens.insert(pool.token0);
            tokens.insert(pool.token1);
        }

        let mut priced = 0;
        for token_key in tokens {
            let Ok(token) = token_key.parse::<Address>() else {
                continue;
            };
            match self.price_usd(chain_id, token, None).await {
                Ok(_) => priced += 1,
                Err(LedgerError::NoPrice { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(priced)
    }

    fn cache_get(
        &self,
        chain_id: u64,
        token_key: &str,
        at: Option<i64>,
        now: i64,
    ) -> Option<PriceQuote> {
        match at {
            Some(ts) => self
                .historical_cache
                .read()
                .ok()?
                .get(&(chain_id, token_key.to_string(), ts))
                .copied(),
            None => {
                let hit = self
                    .live_cache
                    .read()
                    .ok()?
                    .get(&(chain_id, token_key.to_string()))
                    .copied()?;
                (now - hit.as_of <= LIVE_TTL_SECS).then_some(hit)
            }
        }
    }

    async fn persist_and_cache(
        &self,
        chain_id: u64,
        token_key: &str,
        at: Option<i64>,
        quote: PriceQuote,
    ) -> LedgerResult<()> {
        self.repo
            .insert_token_price(&TokenPriceRow {
                chain_id: i64::try_from(chain_id).unwrap_or(i64::MAX),
                token: token_key.to_string(),
                as_of: quote.as_of,
                price_usd: quote.price_usd,
                source: quote.source.as_str().to_string(),
                confidence: match quote.source {
                    PricingSource::Defillama => 1.0,
                    PricingSource::Coingecko => 0.8,
                    PricingSource::DexDerived => 0.6,
                    PricingSource::Legacy => 0.4,
                    PricingSource::Deprecated | PricingSource::Unvalued => 0.0,
                },
            })
            .await?;

        match at {
            Some(ts) => {
                if let Ok(mut cache) = self.historical_cache.write() {
                    cache.insert((chain_id, token_key.to_string(), ts), quote);
                }
            }
            None => {
                if let Ok(mut cache) = self.live_cache.write() {
                    cache.insert((chain_id, token_key.to_string()), quote);
                }
            }
        }
        Ok(())
    }

    /// Build the pair graph from persisted pool state and derive a price.
    async fn dex_derived(&self, chain_id: u64, token_key: &str) -> LedgerResult<Option<f64>> {
        if self.stables.contains(token_key) {
            return Ok(Some(1.0));
        }

        let pools = self.repo.list_pool_descriptors(Some(chain_id)).await?;
        if pools.is_empty() {
            return Ok(None);
        }

        let mut graph = DexGraph::default();
        for pool in &pools {
            let Some(state) = self
                .repo
                .latest_lp_state(chain_id, u64::try_from(pool.pool_id).unwrap_or(0))
                .await?
            else {
                continue;
            };
            let reserve0 = display_units(u256_from_db(&state.reserve0)?, 18);
            let reserve1 = display_units(u256_from_db(&state.reserve1)?, 18);
            graph.add_pair(&pool.token0, &pool.token1, reserve0, reserve1);
        }

        let numeraires: HashMap<String, f64> =
            self.stables.iter().map(|s| (s.clone(), 1.0)).collect();

        Ok(graph.derive(token_key, &numeraires))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::db::models::PoolDescriptorRow;
    use crate::db::models::{u256_to_db, LpPoolStateRow};

    async fn setup() -> Arc<Repository> {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        Arc::new(Repository::new(pool))
    }

    fn wei(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
    }

    struct StaticSource(Option<f64>);

    #[axum::async_trait]
    impl RemotePriceSource for StaticSource {
        async fn fetch(
            &self,
            _chain_slug: &str,
            _token: Address,
            _at: Option<i64>,
        ) -> LedgerResult<Option<f64>> {
            Ok(self.0)
        }
    }

    struct FailingSource;

    #[axum::async_trait]
    impl RemotePriceSource for FailingSource {
        async fn fetch(
            &self,
            _chain_slug: &str,
            _token: Address,
            _at: Option<i64>,
        ) -> LedgerResult<Option<f64>> {
            Err(LedgerError::rpc_transient("source down", None))
        }
    }

    #[test]
    fn test_display_units() {
        assert!((display_units(wei(10), 18) - 10.0).abs() < 1e-12);
        let half = U256::from(5u64) * U256::from(10u64).pow(U256::from(17u64));
        assert!((display_units(half, 18) - 0.5).abs() < 1e-12);
        assert!((display_units(U256::ZERO, 18)).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_authoritative_source_wins() {
        let repo = setup().await;
        let oracle = PriceOracle::with_remotes(
            repo,
            vec![
                (PricingSource::Defillama, Box::new(StaticSource(Some(4.2)))),
                (PricingSource::Coingecko, Box::new(StaticSource(Some(9.9)))),
            ],
        );

        let quote = oracle
            .price_usd(53935, Address::repeat_byte(0x01), None)
            .await
            .unwrap();
        assert_eq!(quote.source, PricingSource::Defillama);
        assert!((quote.price_usd - 4.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_on_miss_and_failure() {
        let repo = setup().await;
        let oracle = PriceOracle::with_remotes(
            repo,
            vec![
                (PricingSource::Defillama, Box::new(FailingSource)),
                (PricingSource::Coingecko, Box::new(StaticSource(Some(2.0)))),
            ],
        );

        let quote = oracle
            .price_usd(53935, Address::repeat_byte(0x01), None)
            .await
            .unwrap();
        assert_eq!(quote.source, PricingSource::Coingecko);
    }

    #[tokio::test]
    async fn test_no_price_error_when_exhausted() {
        let repo = setup().await;
        let oracle = PriceOracle::with_remotes(
            repo,
            vec![(PricingSource::Defillama, Box::new(StaticSource(None)))],
        );

        let err = oracle
            .price_usd(53935, Address::repeat_byte(0x01), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NoPrice { .. }));
    }

    #[tokio::test]
    async fn test_deprecated_token_is_zero() {
        let repo = setup().await;
        let token = Address::repeat_byte(0x01);
        let oracle = PriceOracle::with_remotes(
            repo,
            vec![(PricingSource::Defillama, Box::new(StaticSource(None)))],
        )
        .with_deprecated(HashSet::from([format!("{token:?}")]));

        let quote = oracle.price_usd(53935, token, None).await.unwrap();
        assert_eq!(quote.source, PricingSource::Deprecated);
        assert!(quote.price_usd.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_live_cache_hit_skips_sources() {
        let repo = setup().await;
        let token = Address::repeat_byte(0x01);
        let oracle = PriceOracle::with_remotes(
            repo,
            vec![(PricingSource::Defillama, Box::new(StaticSource(Some(3.0))))],
        );

        let first = oracle.price_usd(53935, token, None).await.unwrap();
        // Swap would require re-resolution; the cache answers instead.
        let second = oracle.price_usd(53935, token, None).await.unwrap();
        assert!((first.price_usd - second.price_usd).abs() < 1e-12);
        assert_eq!(second.as_of, first.as_of);
    }

    async fn seed_pair(
        repo: &Repository,
        pool_id: i64,
        token0: &str,
        token1: &str,
        reserve0: U256,
        reserve1: U256,
    ) {
        repo.upsert_pool_descriptor(&PoolDescriptorRow {
            chain_id: 53935,
            pool_id,
            lp_token: format!("0xlp{pool_id}"),
            token0: token0.to_string(),
            token1: token1.to_string(),
            master_contract: "0xmaster".to_string(),
            version: "v2".to_string(),
        })
        .await
        .unwrap();
        repo.insert_lp_pool_state(&LpPoolStateRow {
            chain_id: 53935,
            pool_id,
            as_of: 1_700_000_000,
            total_lp: u256_to_db(wei(1_000)),
            reserve0: u256_to_db(reserve0),
            reserve1: u256_to_db(reserve1),
            token0_price_usd: None,
            token1_price_usd: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dex_derived_single_hop() {
        let repo = setup().await;
        let game = "0x1111111111111111111111111111111111111111";
        let stable = "0x2222222222222222222222222222222222222222";

        // 100 GAME / 250 STABLE: one GAME is 2.5 USD.
        seed_pair(&repo, 1, game, stable, wei(100), wei(250)).await;

        let oracle = PriceOracle::with_remotes(
            repo,
            vec![(PricingSource::Defillama, Box::new(StaticSource(None)))],
        )
        .with_stables(HashSet::from([stable.to_string()]));

        let quote = oracle
            .price_usd(53935, game.parse().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(quote.source, PricingSource::DexDerived);
        assert!((quote.price_usd - 2.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dex_derived_two_hops() {
        let repo = setup().await;
        let item = "0x1111111111111111111111111111111111111111";
        let game = "0x3333333333333333333333333333333333333333";
        let stable = "0x2222222222222222222222222222222222222222";

        // ITEM/GAME at 4 ITEM per GAME; GAME/STABLE at 2.5 USD per GAME.
        seed_pair(&repo, 1, item, game, wei(400), wei(100)).await;
        seed_pair(&repo, 2, game, stable, wei(100), wei(250)).await;

        let oracle = PriceOracle::with_remotes(
            repo,
            vec![(PricingSource::Defillama, Box::new(StaticSource(None)))],
        )
        .with_stables(HashSet::from([stable.to_string()]));

        let quote = oracle
            .price_usd(53935, item.parse().unwrap(), None)
            .await
            .unwrap();
        // 4 ITEM = 1 GAME = 2.5 USD, so ITEM = 0.625 USD.
        assert!((quote.price_usd - 0.625).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dex_derived_prefers_deeper_pair() {
        let repo = setup().await;
        let game = "0x1111111111111111111111111111111111111111";
        let stable = "0x2222222222222222222222222222222222222222";

        // Shallow pair prices GAME at 1.0, deep pair at 2.0; the deep
        // pair's numeraire side wins.
        seed_pair(&repo, 1, game, stable, wei(10), wei(10)).await;
        seed_pair(&repo, 2, game, stable, wei(1_000), wei(2_000)).await;

        let oracle = PriceOracle::with_remotes(
            repo,
            vec![(PricingSource::Defillama, Box::new(StaticSource(None)))],
        )
        .with_stables(HashSet::from([stable.to_string()]));

        let quote = oracle
            .price_usd(53935, game.parse().unwrap(), None)
            .await
            .unwrap();
        assert!((quote.price_usd - 2.0).abs() < 1e-6);
    }
}
