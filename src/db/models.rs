//! Database models that map to SQL tables.
//!
//! These structures represent rows in the database and provide conversions
//! between blockchain types and database representations.
//!
//! High-precision token amounts are stored as zero-padded decimal strings so
//! that lexicographic order equals numeric order ([`u256_to_db`] /
//! [`u256_from_db`]); USD values are stored as REAL and rounded to 6 digits
//! at the edges.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Width of a zero-padded U256 decimal string (2^256 has 78 digits).
const U256_DB_WIDTH: usize = 78;

/// Encode a U256 for a TEXT column, zero-padded to fixed width.
#[must_use]
pub fn u256_to_db(value: U256) -> String {
    format!("{value:0>width$}", width = U256_DB_WIDTH)
}

/// Decode a U256 from a TEXT column.
///
/// # Errors
///
/// Returns a database error when the stored text is not a decimal number.
pub fn u256_from_db(text: &str) -> LedgerResult<U256> {
    U256::from_str_radix(text.trim_start_matches('0'), 10)
        .or_else(|e| {
            // An all-zero string trims to "", which from_str_radix rejects.
            if text.chars().all(|c| c == '0') && !text.is_empty() {
                Ok(U256::ZERO)
            } else {
                Err(e)
            }
        })
        .map_err(|e| {
            LedgerError::database(
                format!("corrupt U256 column value: {text}"),
                Some(Box::new(e)),
            )
        })
}

/// Round a USD value to the 6 fractional digits the schema guarantees.
#[must_use]
pub fn round_usd(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// What a payment request pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentKind {
    /// Player balance top-up
    Deposit,
    /// One-off premium service purchase
    PremiumService,
}

impl PaymentKind {
    /// Stable DB tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::PremiumService => "PREMIUM_SERVICE",
        }
    }

    /// Parse a DB tag.
    ///
    /// # Errors
    ///
    /// Returns a database error for unknown tags.
    pub fn parse(tag: &str) -> LedgerResult<Self> {
        match tag {
            "DEPOSIT" => Ok(Self::Deposit),
            "PREMIUM_SERVICE" => Ok(Self::PremiumService),
            other => Err(LedgerError::database(
                format!("unknown payment kind: {other}"),
                None,
            )),
        }
    }
}

/// Lifecycle state of a payment request. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Awaiting an on-chain transfer
    Pending,
    /// A transfer was matched; downstream processing owed
    Matched,
    /// Expired before any transfer matched
    Expired,
    /// Downstream processing completed
    Consumed,
    /// Downstream processing failed permanently
    Failed,
}

impl PaymentStatus {
    /// Stable DB tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Matched => "MATCHED",
            Self::Expired => "EXPIRED",
            Self::Consumed => "CONSUMED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a DB tag.
    ///
    /// # Errors
    ///
    /// Returns a database error for unknown tags.
    pub fn parse(tag: &str) -> LedgerResult<Self> {
        match tag {
            "PENDING" => Ok(Self::Pending),
            "MATCHED" => Ok(Self::Matched),
            "EXPIRED" => Ok(Self::Expired),
            "CONSUMED" => Ok(Self::Consumed),
            "FAILED" => Ok(Self::Failed),
            other => Err(LedgerError::database(
                format!("unknown payment status: {other}"),
                None,
            )),
        }
    }
}

/// Which rule matched a transfer to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStrategy {
    /// Exact match on the perturbed unique amount
    UniqueExact,
    /// Exact match on the nominal requested amount
    RequestedExact,
    /// Unique amount within 1 wei
    UniqueTolerance,
    /// Known sender wallet within 0.1 display units
    WalletAmount,
}

impl MatchStrategy {
    /// Stable DB tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UniqueExact => "UNIQUE_EXACT",
            Self::RequestedExact => "REQUESTED_EXACT",
            Self::UniqueTolerance => "UNIQUE_TOLERANCE",
            Self::WalletAmount => "WALLET_AMOUNT",
        }
    }
}

/// Provenance of a USD valuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PricingSource {
    /// Authoritative off-chain price API
    Defillama,
    /// Secondary off-chain price API
    Coingecko,
    /// Derived from on-chain DEX reserves
    DexDerived,
    /// Token is on the deprecation list; valued at zero
    Deprecated,
    /// Carried over from the legacy pricing pipeline
    Legacy,
    /// No source could value the token; USD value is zero
    Unvalued,
}

impl PricingSource {
    /// Stable DB tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Defillama => "DEFILLAMA",
            Self::Coingecko => "COINGECKO",
            Self::DexDerived => "DEX_DERIVED",
            Self::Deprecated => "DEPRECATED",
            Self::Legacy => "LEGACY",
            Self::Unvalued => "UNVALUED",
        }
    }

    /// Parse a DB tag.
    ///
    /// # Errors
    ///
    /// Returns a database error for unknown tags.
    pub fn parse(tag: &str) -> LedgerResult<Self> {
        match tag {
            "DEFILLAMA" => Ok(Self::Defillama),
            "COINGECKO" => Ok(Self::Coingecko),
            "DEX_DERIVED" => Ok(Self::DexDerived),
            "DEPRECATED" => Ok(Self::Deprecated),
            "LEGACY" => Ok(Self::Legacy),
            "UNVALUED" => Ok(Self::Unvalued),
            other => Err(LedgerError::database(
                format!("unknown pricing source: {other}"),
                None,
            )),
        }
    }
}

/// A durable indexer cursor row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRow {
    /// Chain id
    pub chain_id: i64,
    /// Contract the cursor belongs to
    pub contract_address: String,
    /// Shard key ('' for single-shard)
    pub shard_key: String,
    /// Highest fully-ingested block
    pub last_processed_block: i64,
    /// Unix timestamp of the last advance
    pub updated_at: i64,
}

/// One immutable decoded event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawEventRow {
    /// Chain id
    pub chain_id: i64,
    /// Transaction hash (hex string)
    pub tx_hash: String,
    /// Log index within the transaction's block
    pub log_index: i64,
    /// Block the event was emitted in
    pub block_number: i64,
    /// Block timestamp (unix seconds, 0 when the RPC omitted it)
    pub block_timestamp: i64,
    /// Emitting contract
    pub contract_address: String,
    /// Event signature topic
    pub topic0: String,
    /// Logical stream discriminator
    pub stream: String,
    /// Tagged JSON payload of the normalized event
    pub payload: String,
    /// Unix timestamp of ingestion
    pub ingested_at: i64,
}

/// Materialized staking balance for one wallet in one pool.
///
/// Stored as monotone deposit/withdraw counters per master-contract
/// generation; applying event deltas is therefore commutative and any
/// partitioning of the block range converges on the same state. Balances
/// are computed at read time, saturating at zero (a withdrawal exceeding
/// tracked deposits means the stream started mid-history).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StakeRow {
    /// Chain id
    pub chain_id: i64,
    /// Pool id within the master contract
    pub pool_id: i64,
    /// Staking wallet
    pub wallet: String,
    /// Total ever deposited through V1
    pub v1_deposited: String,
    /// Total ever withdrawn through V1
    pub v1_withdrawn: String,
    /// Total ever deposited through V2
    pub v2_deposited: String,
    /// Total ever withdrawn through V2
    pub v2_withdrawn: String,
    /// First time this wallet appeared in the pool
    pub first_seen_at: i64,
    /// Last balance change
    pub updated_at: i64,
}

impl StakeRow {
    /// The V1-staked balance as a U256.
    ///
    /// # Errors
    ///
    /// Returns a database error when the stored text is corrupt.
    pub fn v1_amount_wei(&self) -> LedgerResult<U256> {
        Ok(u256_from_db(&self.v1_deposited)?.saturating_sub(u256_from_db(&self.v1_withdrawn)?))
    }

    /// The V2-staked balance as a U256.
    ///
    /// # Errors
    ///
    /// Returns a database error when the stored text is corrupt.
    pub fn v2_amount_wei(&self) -> LedgerResult<U256> {
        Ok(u256_from_db(&self.v2_deposited)?.saturating_sub(u256_from_db(&self.v2_withdrawn)?))
    }

    /// The combined (V1+V2) staked balance as a U256.
    ///
    /// # Errors
    ///
    /// Returns a database error when the stored text is corrupt.
    pub fn lp_amount_wei(&self) -> LedgerResult<U256> {
        Ok(self.v1_amount_wei()?.saturating_add(self.v2_amount_wei()?))
    }
}

/// Static description of one LP pool.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PoolDescriptorRow {
    /// Chain id
    pub chain_id: i64,
    /// Pool id within the master contract
    pub pool_id: i64,
    /// LP token contract
    pub lp_token: String,
    /// First pair token
    pub token0: String,
    /// Second pair token
    pub token1: String,
    /// Master staking contract
    pub master_contract: String,
    /// "v1" or "v2"
    pub version: String,
}

/// Periodic snapshot of an LP pool's supply and reserves.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LpPoolStateRow {
    /// Chain id
    pub chain_id: i64,
    /// Pool id
    pub pool_id: i64,
    /// Snapshot time (unix seconds)
    pub as_of: i64,
    /// Total LP supply, zero-padded decimal
    pub total_lp: String,
    /// token0 reserve, zero-padded decimal
    pub reserve0: String,
    /// token1 reserve, zero-padded decimal
    pub reserve1: String,
    /// token0 USD price at snapshot time, if priced
    pub token0_price_usd: Option<f64>,
    /// token1 USD price at snapshot time, if priced
    pub token1_price_usd: Option<f64>,
}

/// A persisted token price observation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenPriceRow {
    /// Chain id
    pub chain_id: i64,
    /// Token contract
    pub token: String,
    /// Observation time (unix seconds)
    pub as_of: i64,
    /// USD price
    pub price_usd: f64,
    /// Provenance tag
    pub source: String,
    /// Source confidence in [0, 1]
    pub confidence: f64,
}

/// A payment request row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRequestRow {
    /// Request id
    pub id: String,
    /// Player the request belongs to
    pub player_id: String,
    /// DEPOSIT or PREMIUM_SERVICE
    pub kind: String,
    /// Current lifecycle state
    pub status: String,
    /// Bound sender wallet, if any
    pub from_wallet: Option<String>,
    /// Nominal requested amount in wei (zero-padded decimal)
    pub expected_amount_wei: String,
    /// Perturbed unique amount in wei (zero-padded decimal)
    pub unique_amount_wei: String,
    /// Expiry time (unix seconds)
    pub expires_at: i64,
    /// Creation time (unix seconds)
    pub created_at: i64,
    /// Matching transfer hash, set on MATCHED
    pub matched_tx_hash: Option<String>,
    /// Match time, set on MATCHED
    pub matched_at: Option<i64>,
}

impl PaymentRequestRow {
    /// Expected amount as a U256.
    ///
    /// # Errors
    ///
    /// Returns a database error when the stored text is corrupt.
    pub fn expected_amount(&self) -> LedgerResult<U256> {
        u256_from_db(&self.expected_amount_wei)
    }

    /// Unique amount as a U256.
    ///
    /// # Errors
    ///
    /// Returns a database error when the stored text is corrupt.
    pub fn unique_amount(&self) -> LedgerResult<U256> {
        u256_from_db(&self.unique_amount_wei)
    }
}

/// A transfer-to-request match record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchedTransferRow {
    /// Matched request id
    pub request_id: String,
    /// Transfer transaction hash
    pub tx_hash: String,
    /// Block the transfer landed in
    pub block_number: i64,
    /// Sender address
    pub from_address: String,
    /// Transfer amount in wei (zero-padded decimal)
    pub amount_wei: String,
    /// Which strategy matched
    pub match_strategy: String,
    /// Match time (unix seconds)
    pub matched_at: i64,
}

/// A normalized cross-chain transfer record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BridgeEventRow {
    /// Chain id the event was observed on
    pub chain_id: i64,
    /// Transaction hash
    pub tx_hash: String,
    /// Log index
    pub log_index: i64,
    /// "in" or "out"
    pub direction: String,
    /// Wallet on the observed chain
    pub wallet: String,
    /// Bridged token
    pub token: String,
    /// Raw amount in wei (zero-padded decimal)
    pub amount_wei: String,
    /// Chain on the other side
    pub counterparty_chain_id: i64,
    /// USD value at event time (0 when unvalued)
    pub usd_value_at_event: f64,
    /// Valuation provenance; never null
    pub pricing_source: String,
    /// Block number
    pub block_number: i64,
    /// Block timestamp
    pub block_timestamp: i64,
}

/// Daily balance snapshot of a tracked wallet.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WalletSnapshotRow {
    /// Chain id
    pub chain_id: i64,
    /// Snapshotted wallet
    pub wallet: String,
    /// UTC day (YYYY-MM-DD)
    pub as_of_day: String,
    /// Native balance in wei (zero-padded decimal)
    pub native_wei: String,
    /// JSON map of token address to wei balance
    pub token_balances: String,
    /// Capture time (unix seconds)
    pub captured_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u256_round_trip() {
        let values = [
            U256::ZERO,
            U256::from(1u64),
            U256::from(10u64).pow(U256::from(18u64)),
            U256::MAX,
        ];
        for v in values {
            let text = u256_to_db(v);
            assert_eq!(text.len(), 78);
            assert_eq!(u256_from_db(&text).unwrap(), v);
        }
    }

    #[test]
    fn test_u256_db_ordering_matches_numeric() {
        let small = u256_to_db(U256::from(999u64));
        let large = u256_to_db(U256::from(1_000u64));
        assert!(small < large);
    }

    #[test]
    fn test_u256_from_db_rejects_garbage() {
        assert!(u256_from_db("not a number").is_err());
        assert!(u256_from_db("").is_err());
    }

    #[test]
    fn test_round_usd_to_six_digits() {
        assert!((round_usd(1.234_567_89) - 1.234_568).abs() < 1e-9);
        assert!((round_usd(0.1) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_payment_status_tags_round_trip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Matched,
            PaymentStatus::Expired,
            PaymentStatus::Consumed,
            PaymentStatus::Failed,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::parse("NOPE").is_err());
    }

    #[test]
    fn test_pricing_source_tags_round_trip() {
        for source in [
            PricingSource::Defillama,
            PricingSource::Coingecko,
            PricingSource::DexDerived,
            PricingSource::Deprecated,
            PricingSource::Legacy,
            PricingSource::Unvalued,
        ] {
            assert_eq!(PricingSource::parse(source.as_str()).unwrap(), source);
        }
    }
}
