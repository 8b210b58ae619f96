//! Configuration management for the realm-ledger backend.
//!
//! This module handles loading and validating configuration from environment
//! variables using the `dotenvy` crate. All operations return [`LedgerResult`]
//! for comprehensive error handling.
//!
//! ## Environment Variables
//!
//! Required:
//! - `DATABASE_URL`: Primary SQLite database URL (e.g. `sqlite:./ledger.db`)
//!
//! Optional (with defaults):
//! - `FALLBACK_DATABASE_URL`: Secondary database tried when the primary is down
//! - `CHAIN_<id>_RPC_URLS`: Comma-separated RPC endpoints for chain `<id>`
//! - `CONFIRMATION_DEPTH_<id>`: Blocks to stay behind head on chain `<id>`
//! - `CUSTODIAL_WALLET_<id>`: Operator wallet receiving payments on chain `<id>`
//! - `PRODUCTION_MODE`: Auto-start indexers when `true` (default: false)
//! - `BATCH_BLOCKS`: Initial blocks per log query (default: 1000)
//! - `WORKERS_PER_POOL`: Scan workers per LP pool (default: 5)
//! - `API_PORT`: HTTP API port (default: 8080)
//! - `RATE_LIMIT_RPM`: API rate limit per minute (default: 120)
//! - `CORS_ORIGINS`: Comma-separated allowed origins (default: `*`)
//! - `ADMIN_TOKEN`: Bearer token for admin endpoints
//!
//! Contract addresses are configuration, not code: every subscription seeded
//! by [`Config::subscriptions`] can be overridden per chain via
//! `SUBSCRIPTION_<decoder_key>_<id>`.

use std::collections::HashMap;
use std::env;

use alloy::primitives::Address;

use crate::chain::ChainDescriptor;
use crate::error::{LedgerError, LedgerResult};

/// DFK Chain (Avalanche subnet) chain id.
pub const CHAIN_DFK: u64 = 53935;
/// Klaytn/Kaia mainnet chain id.
pub const CHAIN_KLAYTN: u64 = 8217;
/// Harmony shard 0 chain id.
pub const CHAIN_HARMONY: u64 = 1_666_600_000;

/// A contract subscription seed: which contract on which chain feeds which
/// decoder. `start_block` is where a fresh checkpoint begins.
#[derive(Debug, Clone)]
pub struct SubscriptionSeed {
    /// Chain the contract lives on
    pub chain_id: u64,
    /// Contract address (lowercase hex)
    pub address: String,
    /// First block the indexer cares about
    pub start_block: u64,
    /// Decoder key resolved through the decoder registry
    pub decoder_key: String,
    /// Whether the scheduler may start this indexer
    pub enabled: bool,
}

/// Per-chain runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Static chain descriptor (id, name, endpoints, timing)
    pub descriptor: ChainDescriptor,
    /// Custodial wallet receiving player payments on this chain, if any
    pub custodial_wallet: Option<Address>,
    /// Payment token contract monitored by the payment matcher, if any
    pub payment_token: Option<Address>,
}

/// Main configuration struct for the backend.
///
/// Contains all runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Primary database URL
    database_url: String,

    /// Optional fallback database URL
    fallback_database_url: Option<String>,

    /// Per-chain settings keyed by chain id
    chains: HashMap<u64, ChainSettings>,

    /// Contract subscriptions the scheduler instantiates indexers for
    subscriptions: Vec<SubscriptionSeed>,

    /// Whether indexers auto-start (production) or wait for an operator
    production_mode: bool,

    /// Initial blocks per log query
    batch_blocks: u64,

    /// Scan workers per LP pool
    workers_per_pool: usize,

    /// HTTP API port
    api_port: u16,

    /// API rate limit (requests per minute)
    rate_limit_rpm: u32,

    /// Allowed CORS origins
    cors_origins: Vec<String>,

    /// Bearer token for admin endpoints
    admin_token: Option<String>,

    /// Stablecoin numeraires for DEX-derived pricing (lowercase addresses)
    stable_tokens: Vec<String>,

    /// Tokens on the deprecation list, valued at zero (lowercase addresses)
    deprecated_tokens: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This function:
    /// 1. Loads `.env` using `dotenvy` (if present)
    /// 2. Reads and validates all environment variables
    /// 3. Applies defaults for optional variables
    /// 4. Builds per-chain descriptors and the subscription seed list
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `DATABASE_URL` is missing
    /// - A numeric environment variable fails to parse
    /// - A configured wallet or contract address is malformed
    pub fn from_env() -> LedgerResult<Self> {
        // Load .env file if present (ignore error if file doesn't exist)
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").map_err(|e| {
            LedgerError::config(
                "DATABASE_URL environment variable is required",
                Some(Box::new(e)),
            )
        })?;

        if database_url.is_empty() {
            return Err(LedgerError::config(
                "DATABASE_URL must not be empty",
                None,
            ));
        }

        let fallback_database_url = env::var("FALLBACK_DATABASE_URL").ok().filter(|s| !s.is_empty());

        let production_mode = parse_bool_var("PRODUCTION_MODE", false)?;
        let batch_blocks = parse_u64_var("BATCH_BLOCKS", 1000)?;
        let workers_per_pool = usize::try_from(parse_u64_var("WORKERS_PER_POOL", 5)?)
            .map_err(|e| LedgerError::config("WORKERS_PER_POOL out of range", Some(Box::new(e))))?;
        let api_port = u16::try_from(parse_u64_var("API_PORT", 8080)?)
            .map_err(|e| LedgerError::config("API_PORT out of range", Some(Box::new(e))))?;
        let rate_limit_rpm = u32::try_from(parse_u64_var("RATE_LIMIT_RPM", 120)?)
            .map_err(|e| LedgerError::config("RATE_LIMIT_RPM out of range", Some(Box::new(e))))?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let admin_token = env::var("ADMIN_TOKEN").ok().filter(|s| !s.is_empty());

        // Numeraires for DEX-derived pricing; the defaults are the bridged
        // USDC deployments on the covered chains.
        let stable_tokens = parse_address_list_var(
            "STABLE_TOKENS",
            &[
                "0x3ad9dfe640e1a9cc1d9b0948620820d975c3803a",
                "0x985458e523db3d53125813ed68c274899e9dfab4",
            ],
        );
        let deprecated_tokens = parse_address_list_var("DEPRECATED_TOKENS", &[]);

        let mut chains = HashMap::new();
        for descriptor in default_chain_descriptors() {
            let chain_id = descriptor.chain_id;
            let descriptor = apply_chain_env(descriptor)?;

            // Chains without at least one endpoint are dropped entirely;
            // the operator opted out of them.
            if descriptor.rpc_urls.is_empty() {
                continue;
            }

            let custodial_wallet =
                parse_address_var(&format!("CUSTODIAL_WALLET_{chain_id}"))?;
            let payment_token = parse_address_var(&format!("PAYMENT_TOKEN_{chain_id}"))?;

            chains.insert(
                chain_id,
                ChainSettings {
                    descriptor,
                    custodial_wallet,
                    payment_token,
                },
            );
        }

        if chains.is_empty() {
            return Err(LedgerError::config(
                "No chain has any RPC endpoint configured; set CHAIN_<id>_RPC_URLS",
                None,
            ));
        }

        let subscriptions = default_subscriptions()
            .into_iter()
            .filter(|s| chains.contains_key(&s.chain_id))
            .collect();

        Ok(Self {
            database_url,
            fallback_database_url,
            chains,
            subscriptions,
            production_mode,
            batch_blocks,
            workers_per_pool,
            api_port,
            rate_limit_rpm,
            cors_origins,
            admin_token,
            stable_tokens,
            deprecated_tokens,
        })
    }

    /// Get the primary database URL.
    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Get the fallback database URL, if configured.
    #[must_use]
    pub fn fallback_database_url(&self) -> Option<&str> {
        self.fallback_database_url.as_deref()
    }

    /// Per-chain settings keyed by chain id.
    #[must_use]
    pub const fn chains(&self) -> &HashMap<u64, ChainSettings> {
        &self.chains
    }

    /// Settings for a single chain.
    #[must_use]
    pub fn chain(&self, chain_id: u64) -> Option<&ChainSettings> {
        self.chains.get(&chain_id)
    }

    /// Contract subscriptions the scheduler instantiates indexers for.
    #[must_use]
    pub fn subscriptions(&self) -> &[SubscriptionSeed] {
        &self.subscriptions
    }

    /// Whether indexers auto-start without operator intervention.
    #[must_use]
    pub const fn production_mode(&self) -> bool {
        self.production_mode
    }

    /// Initial blocks per log query.
    #[must_use]
    pub const fn batch_blocks(&self) -> u64 {
        self.batch_blocks
    }

    /// Scan workers per LP pool.
    #[must_use]
    pub const fn workers_per_pool(&self) -> usize {
        self.workers_per_pool
    }

    /// HTTP API port.
    #[must_use]
    pub const fn api_port(&self) -> u16 {
        self.api_port
    }

    /// API rate limit (requests per minute).
    #[must_use]
    pub const fn rate_limit_rpm(&self) -> u32 {
        self.rate_limit_rpm
    }

    /// Allowed CORS origins.
    #[must_use]
    pub fn cors_origins(&self) -> &[String] {
        &self.cors_origins
    }

    /// Bearer token for admin endpoints, if configured.
    #[must_use]
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    /// Stablecoin numeraires for DEX-derived pricing.
    #[must_use]
    pub fn stable_tokens(&self) -> &[String] {
        &self.stable_tokens
    }

    /// Tokens on the deprecation list.
    #[must_use]
    pub fn deprecated_tokens(&self) -> &[String] {
        &self.deprecated_tokens
    }
}

/// Read a comma-separated address list with a built-in default.
fn parse_address_list_var(name: &str, default: &[&str]) -> Vec<String> {
    env::var(name).map_or_else(
        |_| default.iter().map(|s| (*s).to_lowercase()).collect(),
        |value| {
            value
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        },
    )
}

/// Built-in chain descriptors for the game economy's chains.
///
/// RPC endpoints here are the public defaults; operators override them via
/// `CHAIN_<id>_RPC_URLS`.
fn default_chain_descriptors() -> Vec<ChainDescriptor> {
    vec![
        ChainDescriptor {
            chain_id: CHAIN_DFK,
            name: "dfkchain".to_string(),
            rpc_urls: vec![
                "https://subnets.avax.network/defi-kingdoms/dfk-chain/rpc".to_string(),
            ],
            native_decimals: 18,
            avg_block_time_secs: 2,
            confirmation_depth: 10,
        },
        ChainDescriptor {
            chain_id: CHAIN_KLAYTN,
            name: "klaytn".to_string(),
            rpc_urls: vec!["https://public-en.node.kaia.io".to_string()],
            native_decimals: 18,
            avg_block_time_secs: 1,
            confirmation_depth: 15,
        },
        ChainDescriptor {
            chain_id: CHAIN_HARMONY,
            name: "harmony".to_string(),
            rpc_urls: vec!["https://api.harmony.one".to_string()],
            native_decimals: 18,
            avg_block_time_secs: 2,
            confirmation_depth: 12,
        },
    ]
}

/// Subscription seeds for the covered event streams.
///
/// Addresses are overridable through `SUBSCRIPTION_<decoder_key>_<chain_id>`.
fn default_subscriptions() -> Vec<SubscriptionSeed> {
    let seeds = [
        // (chain, address, start block, decoder key)
        (
            CHAIN_DFK,
            "0x57dec9cc7f492d6583c773e2e7ad66dcdc6940fb",
            1,
            "pool_staking_v1",
        ),
        (
            CHAIN_DFK,
            "0xad2ea7b7e49be15918e4917736e86ff7feea57c6",
            1,
            "pool_staking_v2",
        ),
        (
            CHAIN_DFK,
            "0x9ed2c155632c042cb8bc20634571ff1ca26f5742",
            1,
            "jeweler_staking",
        ),
        (
            CHAIN_DFK,
            "0xb3f5867e277798b50ba7a71c0b24fdca03045edf",
            1,
            "quest_rewards",
        ),
        (
            CHAIN_DFK,
            "0x501cdc4ef10b63219704bf6adb785dfccb06dee2",
            1,
            "bridge",
        ),
        (
            CHAIN_DFK,
            "0x8dc58d6327e1f65b18b82edfb01a361f3aaef624",
            1,
            "combat",
        ),
        (
            CHAIN_DFK,
            "0x04b9da42306b023f3572e106b11d82aad9d32ebb",
            1,
            "erc20_transfer",
        ),
        (
            CHAIN_KLAYTN,
            "0x30c103f8f5a3a732dfe2dce1cc9446f545527b43",
            1,
            "quest_rewards",
        ),
        (
            CHAIN_HARMONY,
            "0xdb30643c71ac9e2122ca0341ed77d09d5f99f924",
            1,
            "pool_staking_v1",
        ),
        (
            CHAIN_HARMONY,
            "0x72cb10c6bfa5624dd07ef608027e366bd690048f",
            1,
            "erc20_transfer",
        ),
    ];

    seeds
        .into_iter()
        .map(|(chain_id, address, start_block, decoder_key)| {
            let address = env::var(format!(
                "SUBSCRIPTION_{}_{chain_id}",
                decoder_key.to_uppercase()
            ))
            .unwrap_or_else(|_| address.to_string())
            .to_lowercase();

            SubscriptionSeed {
                chain_id,
                address,
                start_block,
                decoder_key: decoder_key.to_string(),
                enabled: true,
            }
        })
        .collect()
}

/// Apply `CHAIN_<id>_RPC_URLS` and `CONFIRMATION_DEPTH_<id>` overrides.
fn apply_chain_env(mut descriptor: ChainDescriptor) -> LedgerResult<ChainDescriptor> {
    let id = descriptor.chain_id;

    if let Ok(urls) = env::var(format!("CHAIN_{id}_RPC_URLS")) {
        descriptor.rpc_urls = urls
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    for url in &descriptor.rpc_urls {
        if !url.starts_with("http") {
            return Err(LedgerError::config(
                format!("CHAIN_{id}_RPC_URLS entry is not an HTTP(S) URL: {url}"),
                None,
            ));
        }
    }

    if let Ok(depth) = env::var(format!("CONFIRMATION_DEPTH_{id}")) {
        descriptor.confirmation_depth = depth.parse::<u64>().map_err(|e| {
            LedgerError::config(
                format!("CONFIRMATION_DEPTH_{id} must be a valid number"),
                Some(Box::new(e)),
            )
        })?;
    }

    Ok(descriptor)
}

fn parse_bool_var(name: &str, default: bool) -> LedgerResult<bool> {
    match env::var(name) {
        Ok(v) => v.parse::<bool>().map_err(|e| {
            LedgerError::config(
                format!("{name} must be 'true' or 'false'"),
                Some(Box::new(e)),
            )
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u64_var(name: &str, default: u64) -> LedgerResult<u64> {
    match env::var(name) {
        Ok(v) => v.parse::<u64>().map_err(|e| {
            LedgerError::config(format!("{name} must be a valid number"), Some(Box::new(e)))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_address_var(name: &str) -> LedgerResult<Option<Address>> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => {
            let addr = v.parse::<Address>().map_err(|e| {
                LedgerError::config(
                    format!("{name} must be a valid address, got: {v}"),
                    Some(Box::new(e)),
                )
            })?;
            Ok(Some(addr))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_requires_database_url() {
        env::remove_var("DATABASE_URL");

        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_defaults() {
        env::set_var("DATABASE_URL", "sqlite::memory:");
        env::remove_var("PRODUCTION_MODE");
        env::remove_var("BATCH_BLOCKS");

        let config = Config::from_env().unwrap();
        assert!(!config.production_mode());
        assert_eq!(config.batch_blocks(), 1000);
        assert_eq!(config.workers_per_pool(), 5);
        assert!(config.chain(CHAIN_DFK).is_some());

        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn test_invalid_custodial_wallet_rejected() {
        env::set_var("DATABASE_URL", "sqlite::memory:");
        env::set_var("CUSTODIAL_WALLET_53935", "not_an_address");

        let result = Config::from_env();
        assert!(result.is_err());

        env::remove_var("CUSTODIAL_WALLET_53935");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn test_confirmation_depth_override() {
        env::set_var("DATABASE_URL", "sqlite::memory:");
        env::set_var("CONFIRMATION_DEPTH_53935", "42");

        let config = Config::from_env().unwrap();
        let settings = config.chain(CHAIN_DFK).unwrap();
        assert_eq!(settings.descriptor.confirmation_depth, 42);

        env::remove_var("CONFIRMATION_DEPTH_53935");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn test_subscriptions_follow_configured_chains() {
        env::set_var("DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();
        for sub in config.subscriptions() {
            assert!(config.chain(sub.chain_id).is_some());
        }

        env::remove_var("DATABASE_URL");
    }
}
