//! API request and response models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::indexer::IndexerStatusSnapshot;

/// Error payload returned by all failing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error kind
    pub error: String,
    /// Human-readable message
    pub message: String,
}

/// Service health.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: String,
    /// Crate version
    pub version: String,
    /// Seconds since process start
    pub uptime_seconds: u64,
    /// "healthy" or "unhealthy"
    pub database_status: String,
    /// Number of registered indexer tasks
    pub indexers: usize,
}

/// One indexer's status row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IndexerStatusResponse {
    /// Task name, e.g. "dfkchain/pool_staking_v2"
    pub name: String,
    /// Chain id
    pub chain_id: u64,
    /// Shard key ('' single-shard, '*' for pool worker sets)
    pub shard_key: String,
    /// Highest fully-ingested block
    pub last_processed_block: u64,
    /// Confirmed head at the last iteration
    pub head: u64,
    /// head minus cursor
    pub lag_blocks: u64,
    /// Whether the scheduler may run the task
    pub enabled: bool,
    /// Whether the task is currently running
    pub running: bool,
    /// Most recent loop error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<IndexerStatusSnapshot> for IndexerStatusResponse {
    fn from(snapshot: IndexerStatusSnapshot) -> Self {
        Self {
            name: snapshot.name,
            chain_id: snapshot.chain_id,
            shard_key: snapshot.shard_key,
            last_processed_block: snapshot.last_processed_block,
            head: snapshot.head,
            lag_blocks: snapshot.lag_blocks,
            enabled: snapshot.enabled,
            running: snapshot.running,
            last_error: snapshot.last_error,
        }
    }
}

/// TVL of one pool.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TvlResponse {
    /// Total USD value of staked LP (0 when unpriced)
    pub tvl_usd: f64,
    /// Fraction of the staked total held through V1
    pub v1_share: f64,
    /// Fraction of the staked total held through V2
    pub v2_share: f64,
    /// Valuation time (unix seconds)
    pub as_of: i64,
    /// Whether both pair tokens had a price
    pub priced: bool,
    /// Why the pool is unpriced, when it is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One staking position.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StakeResponse {
    /// Chain id
    pub chain_id: i64,
    /// Pool id
    pub pool_id: i64,
    /// Staking wallet
    pub wallet: String,
    /// Combined LP amount in wei (decimal string)
    pub lp_amount_wei: String,
    /// V1-staked portion in wei
    pub v1_amount_wei: String,
    /// V2-staked portion in wei
    pub v2_amount_wei: String,
    /// Last balance change (unix seconds)
    pub updated_at: i64,
}

/// One quest reward record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuestRewardResponse {
    /// Quest instance id (decimal string)
    pub quest_id: String,
    /// Rewarded player wallet
    pub player: String,
    /// Hero that ran the quest (decimal string)
    pub hero_id: String,
    /// Rewarded token/item contract
    pub token: String,
    /// Amount in wei (decimal string)
    pub amount_wei: String,
    /// Block the reward was minted in
    pub block_number: i64,
    /// Block timestamp (unix seconds)
    pub block_timestamp: i64,
    /// Minting transaction
    pub tx_hash: String,
}

/// A payment request's current state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentRequestResponse {
    /// Request id
    pub id: String,
    /// Owning player
    pub player_id: String,
    /// DEPOSIT or PREMIUM_SERVICE
    pub kind: String,
    /// PENDING, MATCHED, EXPIRED, CONSUMED or FAILED
    pub status: String,
    /// Bound sender wallet, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_wallet: Option<String>,
    /// Nominal amount in wei (decimal string)
    pub expected_amount_wei: String,
    /// Exact amount the player must send, in wei
    pub unique_amount_wei: String,
    /// Expiry (unix seconds)
    pub expires_at: i64,
    /// Creation time (unix seconds)
    pub created_at: i64,
    /// Matching transfer hash, present once MATCHED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_tx_hash: Option<String>,
    /// Match time, present once MATCHED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<i64>,
}

/// Body for creating a payment request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateRequestBody {
    /// Owning player
    pub player_id: String,
    /// "DEPOSIT" or "PREMIUM_SERVICE"
    pub kind: String,
    /// Nominal amount in wei (decimal string)
    pub expected_amount_wei: String,
    /// Bind the request to a sender wallet
    #[serde(default)]
    pub from_wallet: Option<String>,
    /// Request lifetime in seconds (default 2 h)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    7_200
}

/// Response to a request creation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatedRequestResponse {
    /// Request id
    pub id: String,
    /// The exact amount the player must send, in wei
    pub unique_amount_wei: String,
    /// Expiry (unix seconds)
    pub expires_at: i64,
}

/// One cross-chain transfer with its valuation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BridgeEventResponse {
    /// Chain the event was observed on
    pub chain_id: i64,
    /// Transaction hash
    pub tx_hash: String,
    /// "in" or "out" relative to the observed chain
    pub direction: String,
    /// Wallet on the observed chain
    pub wallet: String,
    /// Bridged token
    pub token: String,
    /// Raw amount in wei (decimal string)
    pub amount_wei: String,
    /// Chain on the other side of the bridge
    pub counterparty_chain_id: i64,
    /// USD value at event time (0 when unvalued)
    pub usd_value_at_event: f64,
    /// Valuation provenance; UNVALUED when no source covered the token
    pub pricing_source: String,
    /// Block number
    pub block_number: i64,
    /// Block timestamp (unix seconds)
    pub block_timestamp: i64,
}

/// Response to an admin lifecycle action.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdminActionResponse {
    /// The task the action applied to
    pub task: String,
    /// "start", "stop" or "reset"
    pub action: String,
    /// Whether the task name resolved
    pub applied: bool,
}
