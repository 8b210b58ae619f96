//! Repository pattern for database operations.
//!
//! Provides high-level CRUD operations for event rows, checkpoints, stakes,
//! pool state, token prices, payment requests and wallet snapshots.
//!
//! Ingestion-path methods (`insert_event`, `apply_stake_delta`,
//! `advance_checkpoint`, `insert_bridge_event`) take a `&mut
//! SqliteConnection` so the indexer can run them inside one transaction:
//! event rows and the checkpoint advance commit or roll back together.

use alloy::primitives::U256;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info, instrument};

use super::models::{
    u256_from_db, u256_to_db, BridgeEventRow, CheckpointRow, LpPoolStateRow, MatchedTransferRow,
    PaymentKind, PaymentRequestRow, PaymentStatus, PoolDescriptorRow, RawEventRow, StakeRow,
    TokenPriceRow, WalletSnapshotRow,
};
use crate::chain::ChainDescriptor;
use crate::config::SubscriptionSeed;
use crate::error::{LedgerError, LedgerResult};
use crate::events::GardenVersion;

/// Repository for database operations.
///
/// Wraps a SQLite connection pool and provides type-safe methods for all
/// database interactions.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Creates a new repository with the given connection pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begin a transaction for a multi-statement ingestion step.
    ///
    /// # Errors
    ///
    /// Returns a database error when no connection can be acquired.
    pub async fn begin(&self) -> LedgerResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| {
            LedgerError::database("Failed to start transaction".to_string(), Some(Box::new(e)))
        })
    }

    /// Health check for database connectivity.
    ///
    /// # Errors
    ///
    /// Returns a database error when the probe query fails.
    pub async fn health_check(&self) -> LedgerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                LedgerError::database("Database health check failed".to_string(), Some(Box::new(e)))
            })?;
        Ok(())
    }

    // ==================== SEED OPERATIONS ====================

    /// Upsert the static chain row from configuration.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn seed_chain(&self, descriptor: &ChainDescriptor) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chains (chain_id, name, native_decimals, avg_block_time_secs, confirmation_depth)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (chain_id) DO UPDATE SET
                name = excluded.name,
                native_decimals = excluded.native_decimals,
                avg_block_time_secs = excluded.avg_block_time_secs,
                confirmation_depth = excluded.confirmation_depth
            "#,
        )
        .bind(i64::try_from(descriptor.chain_id).unwrap_or(i64::MAX))
        .bind(&descriptor.name)
        .bind(i64::from(descriptor.native_decimals))
        .bind(i64::try_from(descriptor.avg_block_time_secs).unwrap_or(0))
        .bind(i64::try_from(descriptor.confirmation_depth).unwrap_or(0))
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::database("Failed to seed chain".to_string(), Some(Box::new(e))))?;

        Ok(())
    }

    /// Upsert a contract subscription row from configuration.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn seed_subscription(&self, seed: &SubscriptionSeed) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contract_subscriptions (chain_id, address, start_block, decoder_key, enabled)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, address, decoder_key) DO UPDATE SET
                start_block = excluded.start_block,
                enabled = excluded.enabled
            "#,
        )
        .bind(i64::try_from(seed.chain_id).unwrap_or(i64::MAX))
        .bind(&seed.address)
        .bind(i64::try_from(seed.start_block).unwrap_or(0))
        .bind(&seed.decoder_key)
        .bind(i64::from(seed.enabled))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to seed subscription".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    // ==================== CHECKPOINT OPERATIONS ====================

    /// Read a checkpoint cursor. Returns `None` on first run.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn get_checkpoint(
        &self,
        chain_id: u64,
        contract: &str,
        shard: &str,
    ) -> LedgerResult<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT last_processed_block FROM checkpoints
            WHERE chain_id = ? AND contract_address = ? AND shard_key = ?
            "#,
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(contract)
        .bind(shard)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to read checkpoint".to_string(), Some(Box::new(e)))
        })?;

        Ok(row.map(|(b,)| u64::try_from(b).unwrap_or(0)))
    }

    /// Advance a checkpoint cursor inside the caller's transaction.
    ///
    /// Guarded by `new_block > current`: an equal advance is idempotent, a
    /// regression fails with [`LedgerError::NonMonotonicCheckpoint`] and the
    /// caller must stop the indexer.
    ///
    /// # Errors
    ///
    /// Non-monotonic advance or database failure.
    pub async fn advance_checkpoint(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        contract: &str,
        shard: &str,
        new_block: u64,
        now: i64,
    ) -> LedgerResult<()> {
        let chain = i64::try_from(chain_id).unwrap_or(i64::MAX);
        let current: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT last_processed_block FROM checkpoints
            WHERE chain_id = ? AND contract_address = ? AND shard_key = ?
            "#,
        )
        .bind(chain)
        .bind(contract)
        .bind(shard)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to read checkpoint".to_string(), Some(Box::new(e)))
        })?;

        if let Some((current,)) = current {
            let current = u64::try_from(current).unwrap_or(0);
            if new_block == current {
                // Concurrent equal advance: idempotent.
                return Ok(());
            }
            if new_block < current {
                return Err(LedgerError::NonMonotonicCheckpoint {
                    current,
                    attempted: new_block,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (chain_id, contract_address, shard_key, last_processed_block, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, contract_address, shard_key) DO UPDATE SET
                last_processed_block = excluded.last_processed_block,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(chain)
        .bind(contract)
        .bind(shard)
        .bind(i64::try_from(new_block).unwrap_or(i64::MAX))
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to advance checkpoint".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// Delete all shards of one contract's checkpoint (admin reset). The
    /// next scan restarts from the subscription's start block; replayed
    /// rows are absorbed by the primary key.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn delete_checkpoints(&self, chain_id: u64, contract: &str) -> LedgerResult<u64> {
        let result =
            sqlx::query("DELETE FROM checkpoints WHERE chain_id = ? AND contract_address = ?")
                .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
                .bind(contract)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    LedgerError::database(
                        "Failed to delete checkpoints".to_string(),
                        Some(Box::new(e)),
                    )
                })?;

        Ok(result.rows_affected())
    }

    /// All checkpoint rows, for the status API and freshness alerts.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn list_checkpoints(&self) -> LedgerResult<Vec<CheckpointRow>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints ORDER BY chain_id, contract_address, shard_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to list checkpoints".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    // ==================== EVENT OPERATIONS ====================

    /// Insert one decoded event row inside the caller's transaction.
    ///
    /// Returns `true` if the row was new, `false` when the
    /// `(chain_id, tx_hash, log_index)` key already existed.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn insert_event(
        &self,
        conn: &mut SqliteConnection,
        row: &RawEventRow,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO raw_events (
                chain_id, tx_hash, log_index, block_number, block_timestamp,
                contract_address, topic0, stream, payload, ingested_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(row.chain_id)
        .bind(&row.tx_hash)
        .bind(row.log_index)
        .bind(row.block_number)
        .bind(row.block_timestamp)
        .bind(&row.contract_address)
        .bind(&row.topic0)
        .bind(&row.stream)
        .bind(&row.payload)
        .bind(row.ingested_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database(
                format!("Failed to insert event at block {}", row.block_number),
                Some(Box::new(e)),
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Count event rows for a contract, for idempotence checks.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn count_events(&self, chain_id: u64, contract: &str) -> LedgerResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM raw_events WHERE chain_id = ? AND contract_address = ?",
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(contract)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to count events".to_string(), Some(Box::new(e)))
        })?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Recent events on a stream, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn events_by_stream(
        &self,
        stream: &str,
        limit: i64,
    ) -> LedgerResult<Vec<RawEventRow>> {
        let rows = sqlx::query_as::<_, RawEventRow>(
            r#"
            SELECT * FROM raw_events
            WHERE stream = ?
            ORDER BY block_number DESC, log_index DESC
            LIMIT ?
            "#,
        )
        .bind(stream)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query stream events".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    /// Quest-reward rows for one hero, oldest first.
    ///
    /// The hero id is matched against the tagged JSON payload, which stores
    /// U256 values as minimal lowercase hex.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn quest_rewards_for_hero(&self, hero_id: u64) -> LedgerResult<Vec<RawEventRow>> {
        let hero_hex = format!("{:#x}", U256::from(hero_id));

        let rows = sqlx::query_as::<_, RawEventRow>(
            r#"
            SELECT * FROM raw_events
            WHERE stream = 'quest_rewards'
              AND json_extract(payload, '$.hero_id') = ?
            ORDER BY block_number ASC, log_index ASC
            "#,
        )
        .bind(hero_hex)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query hero rewards".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    // ==================== STAKE OPERATIONS ====================

    /// Apply a deposit or withdrawal to a wallet's staked balance, inside
    /// the caller's transaction.
    ///
    /// The delta adds onto the monotone deposited/withdrawn counter for
    /// `version`; balances are computed at read time. Pure addition keeps
    /// the materialization commutative, so pool workers replaying ranges
    /// in any order converge on the same state.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_stake_delta(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        pool_id: u64,
        wallet: &str,
        version: GardenVersion,
        delta: U256,
        withdraw: bool,
        now: i64,
    ) -> LedgerResult<()> {
        let chain = i64::try_from(chain_id).unwrap_or(i64::MAX);
        let pool = i64::try_from(pool_id).unwrap_or(i64::MAX);

        let current: Option<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT v1_deposited, v1_withdrawn, v2_deposited, v2_withdrawn
            FROM stakes WHERE chain_id = ? AND pool_id = ? AND wallet = ?
            "#,
        )
        .bind(chain)
        .bind(pool)
        .bind(wallet)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to read stake".to_string(), Some(Box::new(e)))
        })?;

        let (mut v1_dep, mut v1_wd, mut v2_dep, mut v2_wd) = match &current {
            Some((a, b, c, d)) => (
                u256_from_db(a)?,
                u256_from_db(b)?,
                u256_from_db(c)?,
                u256_from_db(d)?,
            ),
            None => (U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO),
        };

        let counter = match (version, withdraw) {
            (GardenVersion::V1, false) => &mut v1_dep,
            (GardenVersion::V1, true) => &mut v1_wd,
            (GardenVersion::V2, false) => &mut v2_dep,
            (GardenVersion::V2, true) => &mut v2_wd,
        };
        *counter = counter.saturating_add(delta);

        sqlx::query(
            r#"
            INSERT INTO stakes (
                chain_id, pool_id, wallet,
                v1_deposited, v1_withdrawn, v2_deposited, v2_withdrawn,
                first_seen_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, pool_id, wallet) DO UPDATE SET
                v1_deposited = excluded.v1_deposited,
                v1_withdrawn = excluded.v1_withdrawn,
                v2_deposited = excluded.v2_deposited,
                v2_withdrawn = excluded.v2_withdrawn,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(chain)
        .bind(pool)
        .bind(wallet)
        .bind(u256_to_db(v1_dep))
        .bind(u256_to_db(v1_wd))
        .bind(u256_to_db(v2_dep))
        .bind(u256_to_db(v2_wd))
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to update stake".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// One wallet's stake in one pool.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn get_stake(
        &self,
        chain_id: u64,
        pool_id: u64,
        wallet: &str,
    ) -> LedgerResult<Option<StakeRow>> {
        let row = sqlx::query_as::<_, StakeRow>(
            "SELECT * FROM stakes WHERE chain_id = ? AND pool_id = ? AND wallet = ?",
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(i64::try_from(pool_id).unwrap_or(i64::MAX))
        .bind(wallet)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query stake".to_string(), Some(Box::new(e)))
        })?;

        Ok(row)
    }

    /// All stakes held by one wallet across chains and pools.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn stakes_for_wallet(&self, wallet: &str) -> LedgerResult<Vec<StakeRow>> {
        let rows = sqlx::query_as::<_, StakeRow>(
            "SELECT * FROM stakes WHERE wallet = ? ORDER BY chain_id, pool_id",
        )
        .bind(wallet)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query wallet stakes".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    /// All stakers of one pool.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn stakes_for_pool(&self, chain_id: u64, pool_id: u64) -> LedgerResult<Vec<StakeRow>> {
        let rows = sqlx::query_as::<_, StakeRow>(
            "SELECT * FROM stakes WHERE chain_id = ? AND pool_id = ? ORDER BY wallet",
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(i64::try_from(pool_id).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query pool stakes".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    /// Sum of all tracked stakes in a pool.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn total_staked(&self, chain_id: u64, pool_id: u64) -> LedgerResult<U256> {
        let rows = self.stakes_for_pool(chain_id, pool_id).await?;
        let mut total = U256::ZERO;
        for row in rows {
            total = total.saturating_add(row.lp_amount_wei()?);
        }
        Ok(total)
    }

    // ==================== POOL DESCRIPTOR OPERATIONS ====================

    /// Upsert a pool descriptor.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn upsert_pool_descriptor(&self, row: &PoolDescriptorRow) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pool_descriptors (chain_id, pool_id, lp_token, token0, token1, master_contract, version)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, pool_id) DO UPDATE SET
                lp_token = excluded.lp_token,
                token0 = excluded.token0,
                token1 = excluded.token1,
                master_contract = excluded.master_contract,
                version = excluded.version
            "#,
        )
        .bind(row.chain_id)
        .bind(row.pool_id)
        .bind(&row.lp_token)
        .bind(&row.token0)
        .bind(&row.token1)
        .bind(&row.master_contract)
        .bind(&row.version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to upsert pool descriptor".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// One pool's descriptor.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn get_pool_descriptor(
        &self,
        chain_id: u64,
        pool_id: u64,
    ) -> LedgerResult<Option<PoolDescriptorRow>> {
        let row = sqlx::query_as::<_, PoolDescriptorRow>(
            "SELECT * FROM pool_descriptors WHERE chain_id = ? AND pool_id = ?",
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(i64::try_from(pool_id).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query pool descriptor".to_string(), Some(Box::new(e)))
        })?;

        Ok(row)
    }

    /// All pool descriptors, optionally restricted to one chain.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn list_pool_descriptors(
        &self,
        chain_id: Option<u64>,
    ) -> LedgerResult<Vec<PoolDescriptorRow>> {
        let rows = match chain_id {
            Some(id) => {
                sqlx::query_as::<_, PoolDescriptorRow>(
                    "SELECT * FROM pool_descriptors WHERE chain_id = ? ORDER BY pool_id",
                )
                .bind(i64::try_from(id).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, PoolDescriptorRow>(
                    "SELECT * FROM pool_descriptors ORDER BY chain_id, pool_id",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| {
            LedgerError::database("Failed to list pool descriptors".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    // ==================== LP STATE OPERATIONS ====================

    /// Insert an LP pool snapshot.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn insert_lp_pool_state(&self, row: &LpPoolStateRow) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lp_pool_states (
                chain_id, pool_id, as_of, total_lp, reserve0, reserve1,
                token0_price_usd, token1_price_usd
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, pool_id, as_of) DO UPDATE SET
                total_lp = excluded.total_lp,
                reserve0 = excluded.reserve0,
                reserve1 = excluded.reserve1,
                token0_price_usd = excluded.token0_price_usd,
                token1_price_usd = excluded.token1_price_usd
            "#,
        )
        .bind(row.chain_id)
        .bind(row.pool_id)
        .bind(row.as_of)
        .bind(&row.total_lp)
        .bind(&row.reserve0)
        .bind(&row.reserve1)
        .bind(row.token0_price_usd)
        .bind(row.token1_price_usd)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to insert LP pool state".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// Latest snapshot for a pool.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn latest_lp_state(
        &self,
        chain_id: u64,
        pool_id: u64,
    ) -> LedgerResult<Option<LpPoolStateRow>> {
        let row = sqlx::query_as::<_, LpPoolStateRow>(
            r#"
            SELECT * FROM lp_pool_states
            WHERE chain_id = ? AND pool_id = ?
            ORDER BY as_of DESC
            LIMIT 1
            "#,
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(i64::try_from(pool_id).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query LP pool state".to_string(), Some(Box::new(e)))
        })?;

        Ok(row)
    }

    // ==================== PRICE OPERATIONS ====================

    /// Upsert a token price observation.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn insert_token_price(&self, row: &TokenPriceRow) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO token_prices (chain_id, token, as_of, price_usd, source, confidence)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, token, as_of) DO UPDATE SET
                price_usd = excluded.price_usd,
                source = excluded.source,
                confidence = excluded.confidence
            "#,
        )
        .bind(row.chain_id)
        .bind(&row.token)
        .bind(row.as_of)
        .bind(row.price_usd)
        .bind(&row.source)
        .bind(row.confidence)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to insert token price".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// Most recent price observation at or before `at` (latest overall when
    /// `at` is `None`).
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn token_price_at(
        &self,
        chain_id: u64,
        token: &str,
        at: Option<i64>,
    ) -> LedgerResult<Option<TokenPriceRow>> {
        let row = sqlx::query_as::<_, TokenPriceRow>(
            r#"
            SELECT * FROM token_prices
            WHERE chain_id = ? AND token = ? AND as_of <= ?
            ORDER BY as_of DESC
            LIMIT 1
            "#,
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(token)
        .bind(at.unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query token price".to_string(), Some(Box::new(e)))
        })?;

        Ok(row)
    }

    /// Same lookup inside the caller's transaction, for sinks that value
    /// rows mid-ingestion.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn token_price_at_tx(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        token: &str,
        at: Option<i64>,
    ) -> LedgerResult<Option<TokenPriceRow>> {
        let row = sqlx::query_as::<_, TokenPriceRow>(
            r#"
            SELECT * FROM token_prices
            WHERE chain_id = ? AND token = ? AND as_of <= ?
            ORDER BY as_of DESC
            LIMIT 1
            "#,
        )
        .bind(i64::try_from(chain_id).unwrap_or(i64::MAX))
        .bind(token)
        .bind(at.unwrap_or(i64::MAX))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query token price".to_string(), Some(Box::new(e)))
        })?;

        Ok(row)
    }

    // ==================== PAYMENT OPERATIONS ====================

    /// Insert a new payment request.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure (including a duplicate id).
    pub async fn insert_payment_request(&self, row: &PaymentRequestRow) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_requests (
                id, player_id, kind, status, from_wallet,
                expected_amount_wei, unique_amount_wei, expires_at, created_at,
                matched_tx_hash, matched_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.player_id)
        .bind(&row.kind)
        .bind(&row.status)
        .bind(&row.from_wallet)
        .bind(&row.expected_amount_wei)
        .bind(&row.unique_amount_wei)
        .bind(row.expires_at)
        .bind(row.created_at)
        .bind(&row.matched_tx_hash)
        .bind(row.matched_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to insert payment request".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// One payment request by id.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn get_payment_request(&self, id: &str) -> LedgerResult<Option<PaymentRequestRow>> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(
            "SELECT * FROM payment_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query payment request".to_string(), Some(Box::new(e)))
        })?;

        Ok(row)
    }

    /// All live pending requests: `status = PENDING` and not yet expired.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn pending_requests(&self, now: i64) -> LedgerResult<Vec<PaymentRequestRow>> {
        let rows = sqlx::query_as::<_, PaymentRequestRow>(
            r#"
            SELECT * FROM payment_requests
            WHERE status = 'PENDING' AND expires_at > ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query pending requests".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    /// Whether an active pending request of the same kind already uses this
    /// unique amount.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn unique_amount_in_use(
        &self,
        kind: PaymentKind,
        amount: U256,
        now: i64,
    ) -> LedgerResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM payment_requests
            WHERE kind = ? AND status = 'PENDING' AND expires_at > ? AND unique_amount_wei = ?
            "#,
        )
        .bind(kind.as_str())
        .bind(now)
        .bind(u256_to_db(amount))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to check unique amount".to_string(), Some(Box::new(e)))
        })?;

        Ok(count > 0)
    }

    /// Transition all overdue PENDING requests to EXPIRED. Returns the
    /// number of rows transitioned.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    #[instrument(skip(self))]
    pub async fn expire_due_requests(&self, now: i64) -> LedgerResult<u64> {
        let result = sqlx::query(
            "UPDATE payment_requests SET status = 'EXPIRED' WHERE status = 'PENDING' AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to expire requests".to_string(), Some(Box::new(e)))
        })?;

        let expired = result.rows_affected();
        if expired > 0 {
            info!(expired, "Expired overdue payment requests");
        }
        Ok(expired)
    }

    /// Whether a transfer hash was already consumed by a match.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn matched_transfer_exists(&self, tx_hash: &str) -> LedgerResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM matched_transfers WHERE tx_hash = ?")
                .bind(tx_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    LedgerError::database(
                        "Failed to check matched transfer".to_string(),
                        Some(Box::new(e)),
                    )
                })?;

        Ok(row.is_some())
    }

    /// Transactionally record a match: insert the [`MatchedTransferRow`] and
    /// transition the request `PENDING -> MATCHED`.
    ///
    /// Fails without side effects if the request left PENDING concurrently
    /// or the transfer hash was consumed by another request.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure, or a conflict when the request
    /// is no longer PENDING.
    #[instrument(skip(self, transfer), fields(request_id = %transfer.request_id, tx_hash = %transfer.tx_hash))]
    pub async fn record_match(&self, transfer: &MatchedTransferRow) -> LedgerResult<()> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO matched_transfers (
                request_id, tx_hash, block_number, from_address, amount_wei,
                match_strategy, matched_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&transfer.request_id)
        .bind(&transfer.tx_hash)
        .bind(transfer.block_number)
        .bind(&transfer.from_address)
        .bind(&transfer.amount_wei)
        .bind(&transfer.match_strategy)
        .bind(transfer.matched_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to insert matched transfer".to_string(), Some(Box::new(e)))
        })?;

        let updated = sqlx::query(
            r#"
            UPDATE payment_requests
            SET status = 'MATCHED', matched_tx_hash = ?, matched_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(&transfer.tx_hash)
        .bind(transfer.matched_at)
        .bind(&transfer.request_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to transition request".to_string(), Some(Box::new(e)))
        })?;

        if updated.rows_affected() != 1 {
            // The request left PENDING between selection and commit.
            tx.rollback().await.map_err(|e| {
                LedgerError::database("Failed to roll back match".to_string(), Some(Box::new(e)))
            })?;
            return Err(LedgerError::PaymentConflict {
                message: format!(
                    "request {} was no longer PENDING at match time",
                    transfer.request_id
                ),
            });
        }

        tx.commit().await.map_err(|e| {
            LedgerError::database("Failed to commit match".to_string(), Some(Box::new(e)))
        })?;

        debug!("Recorded payment match");
        Ok(())
    }

    /// Forward-only status transition driven by downstream consumers
    /// (`MATCHED -> CONSUMED` or `MATCHED -> FAILED`). Returns whether a row
    /// transitioned.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn transition_request(
        &self,
        id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> LedgerResult<bool> {
        let result = sqlx::query("UPDATE payment_requests SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                LedgerError::database(
                    "Failed to transition payment request".to_string(),
                    Some(Box::new(e)),
                )
            })?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== BRIDGE OPERATIONS ====================

    /// Insert a normalized bridge event inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn insert_bridge_event(
        &self,
        conn: &mut SqliteConnection,
        row: &BridgeEventRow,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bridge_events (
                chain_id, tx_hash, log_index, direction, wallet, token,
                amount_wei, counterparty_chain_id, usd_value_at_event,
                pricing_source, block_number, block_timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(row.chain_id)
        .bind(&row.tx_hash)
        .bind(row.log_index)
        .bind(&row.direction)
        .bind(&row.wallet)
        .bind(&row.token)
        .bind(&row.amount_wei)
        .bind(row.counterparty_chain_id)
        .bind(row.usd_value_at_event)
        .bind(&row.pricing_source)
        .bind(row.block_number)
        .bind(row.block_timestamp)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to insert bridge event".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }

    /// Recent bridge events, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn recent_bridge_events(&self, limit: i64) -> LedgerResult<Vec<BridgeEventRow>> {
        let rows = sqlx::query_as::<_, BridgeEventRow>(
            "SELECT * FROM bridge_events ORDER BY block_number DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to query bridge events".to_string(), Some(Box::new(e)))
        })?;

        Ok(rows)
    }

    // ==================== SNAPSHOT OPERATIONS ====================

    /// Upsert a daily wallet snapshot.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn upsert_wallet_snapshot(&self, row: &WalletSnapshotRow) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_snapshots (
                chain_id, wallet, as_of_day, native_wei, token_balances, captured_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, wallet, as_of_day) DO UPDATE SET
                native_wei = excluded.native_wei,
                token_balances = excluded.token_balances,
                captured_at = excluded.captured_at
            "#,
        )
        .bind(row.chain_id)
        .bind(&row.wallet)
        .bind(&row.as_of_day)
        .bind(&row.native_wei)
        .bind(&row.token_balances)
        .bind(row.captured_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to upsert wallet snapshot".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    async fn setup_test_db() -> Repository {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create pool");
        Repository::new(pool)
    }

    fn event_row(tx_hash: &str, log_index: i64, block: i64) -> RawEventRow {
        RawEventRow {
            chain_id: 53935,
            tx_hash: tx_hash.to_string(),
            log_index,
            block_number: block,
            block_timestamp: 1_700_000_000,
            contract_address: "0xpool".to_string(),
            topic0: "0xsig".to_string(),
            stream: "pool_staking".to_string(),
            payload: "{}".to_string(),
            ingested_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_event_insert_is_exactly_once() {
        let repo = setup_test_db().await;
        let row = event_row("0xtx1", 0, 100);

        let mut tx = repo.begin().await.unwrap();
        assert!(repo.insert_event(&mut tx, &row).await.unwrap());
        // Second insert of the same key is ignored.
        assert!(!repo.insert_event(&mut tx, &row).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(repo.count_events(53935, "0xpool").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_advance_and_idempotence() {
        let repo = setup_test_db().await;

        assert_eq!(repo.get_checkpoint(1, "0xc", "").await.unwrap(), None);

        let mut tx = repo.begin().await.unwrap();
        repo.advance_checkpoint(&mut tx, 1, "0xc", "", 100, 0)
            .await
            .unwrap();
        // Equal advance is idempotent.
        repo.advance_checkpoint(&mut tx, 1, "0xc", "", 100, 0)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(repo.get_checkpoint(1, "0xc", "").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_checkpoint_regression_fails_loudly() {
        let repo = setup_test_db().await;

        let mut tx = repo.begin().await.unwrap();
        repo.advance_checkpoint(&mut tx, 1, "0xc", "", 100, 0)
            .await
            .unwrap();
        let err = repo
            .advance_checkpoint(&mut tx, 1, "0xc", "", 90, 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NonMonotonicCheckpoint {
                current: 100,
                attempted: 90
            }
        ));
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_nothing() {
        let repo = setup_test_db().await;

        {
            let mut tx = repo.begin().await.unwrap();
            repo.insert_event(&mut tx, &event_row("0xtx9", 0, 500))
                .await
                .unwrap();
            repo.advance_checkpoint(&mut tx, 53935, "0xpool", "", 500, 0)
                .await
                .unwrap();
            // Dropped without commit: simulates a crash mid-iteration.
        }

        assert_eq!(repo.count_events(53935, "0xpool").await.unwrap(), 0);
        assert_eq!(repo.get_checkpoint(53935, "0xpool", "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stake_deltas_accumulate_and_clamp() {
        let repo = setup_test_db().await;

        let mut tx = repo.begin().await.unwrap();
        repo.apply_stake_delta(&mut tx, 1, 7, "0xw", GardenVersion::V1, U256::from(100u64), false, 0)
            .await
            .unwrap();
        repo.apply_stake_delta(&mut tx, 1, 7, "0xw", GardenVersion::V2, U256::from(50u64), false, 1)
            .await
            .unwrap();
        repo.apply_stake_delta(&mut tx, 1, 7, "0xw", GardenVersion::V1, U256::from(30u64), true, 2)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Versions are tracked separately and summed at read time.
        let stake = repo.get_stake(1, 7, "0xw").await.unwrap().unwrap();
        assert_eq!(stake.lp_amount_wei().unwrap(), U256::from(120u64));
        assert_eq!(stake.v1_amount_wei().unwrap(), U256::from(70u64));
        assert_eq!(stake.v2_amount_wei().unwrap(), U256::from(50u64));

        // Over-withdrawal saturates the computed balance at zero; the
        // other generation is untouched.
        let mut tx = repo.begin().await.unwrap();
        repo.apply_stake_delta(&mut tx, 1, 7, "0xw", GardenVersion::V1, U256::from(1_000u64), true, 3)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let stake = repo.get_stake(1, 7, "0xw").await.unwrap().unwrap();
        assert_eq!(stake.v1_amount_wei().unwrap(), U256::ZERO);
        assert_eq!(stake.lp_amount_wei().unwrap(), U256::from(50u64));
    }

    #[tokio::test]
    async fn test_stake_deltas_commute() {
        // The same event set applied in two different orders must converge
        // on identical balances; pool workers depend on this.
        let deltas = [
            (GardenVersion::V1, U256::from(100u64), false),
            (GardenVersion::V1, U256::from(40u64), true),
            (GardenVersion::V2, U256::from(25u64), false),
            (GardenVersion::V1, U256::from(10u64), false),
        ];

        let forward = setup_test_db().await;
        let mut tx = forward.begin().await.unwrap();
        for (version, amount, withdraw) in deltas {
            forward
                .apply_stake_delta(&mut tx, 1, 3, "0xw", version, amount, withdraw, 0)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let reversed = setup_test_db().await;
        let mut tx = reversed.begin().await.unwrap();
        for (version, amount, withdraw) in deltas.iter().rev() {
            reversed
                .apply_stake_delta(&mut tx, 1, 3, "0xw", *version, *amount, *withdraw, 0)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let a = forward.get_stake(1, 3, "0xw").await.unwrap().unwrap();
        let b = reversed.get_stake(1, 3, "0xw").await.unwrap().unwrap();
        assert_eq!(a.lp_amount_wei().unwrap(), b.lp_amount_wei().unwrap());
        assert_eq!(a.v1_amount_wei().unwrap(), U256::from(70u64));
    }

    #[tokio::test]
    async fn test_payment_request_lifecycle() {
        let repo = setup_test_db().await;

        let request = PaymentRequestRow {
            id: "r1".to_string(),
            player_id: "p1".to_string(),
            kind: "DEPOSIT".to_string(),
            status: "PENDING".to_string(),
            from_wallet: None,
            expected_amount_wei: u256_to_db(U256::from(10u64)),
            unique_amount_wei: u256_to_db(U256::from(10u64)),
            expires_at: 2_000_000_000,
            created_at: 1_000_000_000,
            matched_tx_hash: None,
            matched_at: None,
        };
        repo.insert_payment_request(&request).await.unwrap();

        let pending = repo.pending_requests(1_500_000_000).await.unwrap();
        assert_eq!(pending.len(), 1);

        let transfer = MatchedTransferRow {
            request_id: "r1".to_string(),
            tx_hash: "0xtx".to_string(),
            block_number: 42,
            from_address: "0xsender".to_string(),
            amount_wei: u256_to_db(U256::from(10u64)),
            match_strategy: "UNIQUE_EXACT".to_string(),
            matched_at: 1_500_000_001,
        };
        repo.record_match(&transfer).await.unwrap();

        let row = repo.get_payment_request("r1").await.unwrap().unwrap();
        assert_eq!(row.status, "MATCHED");
        assert_eq!(row.matched_tx_hash.as_deref(), Some("0xtx"));
        assert!(repo.matched_transfer_exists("0xtx").await.unwrap());

        // Matching again conflicts: the request already left PENDING.
        let again = MatchedTransferRow {
            tx_hash: "0xtx2".to_string(),
            ..transfer
        };
        assert!(repo.record_match(&again).await.is_err());

        // Downstream consumption is forward-only.
        assert!(repo
            .transition_request("r1", PaymentStatus::Matched, PaymentStatus::Consumed)
            .await
            .unwrap());
        assert!(!repo
            .transition_request("r1", PaymentStatus::Matched, PaymentStatus::Consumed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let repo = setup_test_db().await;

        let request = PaymentRequestRow {
            id: "r2".to_string(),
            player_id: "p1".to_string(),
            kind: "DEPOSIT".to_string(),
            status: "PENDING".to_string(),
            from_wallet: None,
            expected_amount_wei: u256_to_db(U256::from(10u64)),
            unique_amount_wei: u256_to_db(U256::from(10u64)),
            expires_at: 100,
            created_at: 50,
            matched_tx_hash: None,
            matched_at: None,
        };
        repo.insert_payment_request(&request).await.unwrap();

        assert_eq!(repo.expire_due_requests(200).await.unwrap(), 1);
        let row = repo.get_payment_request("r2").await.unwrap().unwrap();
        assert_eq!(row.status, "EXPIRED");

        // Expired requests no longer count as pending.
        assert!(repo.pending_requests(200).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_amount_in_use_scoped_to_kind() {
        let repo = setup_test_db().await;

        let request = PaymentRequestRow {
            id: "r3".to_string(),
            player_id: "p1".to_string(),
            kind: "DEPOSIT".to_string(),
            status: "PENDING".to_string(),
            from_wallet: None,
            expected_amount_wei: u256_to_db(U256::from(10u64)),
            unique_amount_wei: u256_to_db(U256::from(777u64)),
            expires_at: 2_000_000_000,
            created_at: 0,
            matched_tx_hash: None,
            matched_at: None,
        };
        repo.insert_payment_request(&request).await.unwrap();

        assert!(repo
            .unique_amount_in_use(PaymentKind::Deposit, U256::from(777u64), 100)
            .await
            .unwrap());
        assert!(!repo
            .unique_amount_in_use(PaymentKind::PremiumService, U256::from(777u64), 100)
            .await
            .unwrap());
        assert!(!repo
            .unique_amount_in_use(PaymentKind::Deposit, U256::from(778u64), 100)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_quest_rewards_queried_by_hero() {
        let repo = setup_test_db().await;

        let payload = serde_json::json!({
            "type": "quest_reward",
            "quest_id": "0x1",
            "player": "0x8888888888888888888888888888888888888888",
            "hero_id": format!("{:#x}", U256::from(42u64)),
            "token": "0x9999999999999999999999999999999999999999",
            "amount": "0xde0b6b3a7640000",
        })
        .to_string();

        let mut row = event_row("0xqr1", 0, 10);
        row.stream = "quest_rewards".to_string();
        row.payload = payload;

        let mut tx = repo.begin().await.unwrap();
        repo.insert_event(&mut tx, &row).await.unwrap();
        tx.commit().await.unwrap();

        let rewards = repo.quest_rewards_for_hero(42).await.unwrap();
        assert_eq!(rewards.len(), 1);
        assert!(repo.quest_rewards_for_hero(43).await.unwrap().is_empty());
    }
}
