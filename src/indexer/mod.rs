//! The multi-chain event indexer framework.
//!
//! A single [`Indexer`] turns RPC log queries into durable, checkpointed
//! event rows. It is parameterized by a chain client, a contract
//! subscription (address + decoder key), a shard key, and a sink for
//! derived-state updates.
//!
//! # Main loop
//!
//! 1. Read the checkpoint cursor.
//! 2. Compute the confirmed head (chain head minus confirmation depth).
//! 3. Caught up? Sleep five block times and retry.
//! 4. Scan `(lastDone, lastDone + batchBlocks]`, decode each log.
//! 5. In one transaction: insert rows (`ON CONFLICT DO NOTHING` on the
//!    `(chain, tx, log)` key), apply the sink for newly inserted rows,
//!    advance the checkpoint, commit.
//! 6. Emit new rows on the broadcast channel.
//!
//! # Invariants
//!
//! - An event row exists iff the enclosing checkpoint advance committed.
//! - Scanned ranges are strictly consecutive; a malformed record is skipped
//!   but never a block.
//! - Errors never escape the loop: the indexer logs, records the error for
//!   the status API, and self-heals. The one exception is a non-monotonic
//!   checkpoint, which stops the indexer loudly.
//!
//! # Batch sizing
//!
//! When an endpoint rejects a log query as too wide, `batch_blocks` halves
//! (floor 16) and the scan retries; after each successful scan it grows by
//! 25% up to the configured maximum.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use alloy::rpc::types::Filter;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::db::models::RawEventRow;
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{DecodedEvent, DecoderRegistry};

pub mod checkpoint;
pub mod native;
pub mod sink;
pub mod steal;

use checkpoint::CheckpointStore;
use sink::{EventContext, EventSink};

/// Bounded broadcast buffer; slow consumers lose messages and must re-read
/// from the database.
pub const BROADCAST_CAPACITY: usize = 4096;

/// Floor for the adaptive batch size.
pub const MIN_BATCH_BLOCKS: u64 = 16;

/// Static parameters of one indexer instance.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Display name, e.g. `dfkchain/pool_staking_v2`
    pub name: String,
    /// Chain the subscription lives on
    pub chain_id: u64,
    /// Subscribed contract
    pub contract: Address,
    /// Decoder key resolved through the registry
    pub decoder_key: String,
    /// Shard key ('' for single-shard)
    pub shard_key: String,
    /// First block of interest when no checkpoint exists yet
    pub start_block: u64,
    /// Initial blocks per log query
    pub batch_blocks: u64,
    /// Upper bound the adaptive batch may grow back to
    pub max_batch_blocks: u64,
}

/// A newly committed event, broadcast to in-process consumers.
///
/// Delivery is at-most-once per process lifetime; consumers needing replay
/// must read the event table.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Chain id
    pub chain_id: u64,
    /// Transaction hash (hex string)
    pub tx_hash: String,
    /// Log index
    pub log_index: u64,
    /// Block number
    pub block_number: u64,
    /// Block timestamp (unix seconds, 0 when unavailable)
    pub block_timestamp: i64,
    /// The normalized payload
    pub event: DecodedEvent,
}

/// Shared, lock-light view of one indexer's health for the status API.
#[derive(Debug)]
pub struct IndexerStatus {
    /// Display name
    pub name: String,
    /// Chain id
    pub chain_id: u64,
    /// Shard key
    pub shard_key: String,
    last_processed: AtomicU64,
    head: AtomicU64,
    enabled: AtomicBool,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Serializable point-in-time copy of an [`IndexerStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatusSnapshot {
    /// Display name
    pub name: String,
    /// Chain id
    pub chain_id: u64,
    /// Shard key
    pub shard_key: String,
    /// Highest fully-ingested block
    pub last_processed_block: u64,
    /// Confirmed head at the last loop iteration
    pub head: u64,
    /// head - last_processed_block
    pub lag_blocks: u64,
    /// Whether the scheduler may run this indexer
    pub enabled: bool,
    /// Whether the task is currently running
    pub running: bool,
    /// Most recent loop error, if any
    pub last_error: Option<String>,
}

impl IndexerStatus {
    /// Create a status cell for a named indexer.
    #[must_use]
    pub fn new(name: &str, chain_id: u64, shard_key: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            chain_id,
            shard_key: shard_key.to_string(),
            last_processed: AtomicU64::new(0),
            head: AtomicU64::new(0),
            enabled: AtomicBool::new(enabled),
            running: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Record the confirmed head seen this iteration.
    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::Relaxed);
    }

    /// Record the cursor position.
    pub fn set_last_processed(&self, block: u64) {
        self.last_processed.store(block, Ordering::Relaxed);
    }

    /// Flip the running flag.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Whether the task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Enable or disable the indexer (operator action).
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the scheduler may run this indexer.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record a loop error for the status API.
    pub fn set_error(&self, err: &LedgerError) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(err.to_string());
        }
    }

    /// Clear the recorded error after a healthy iteration.
    pub fn clear_error(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    /// Point-in-time serializable copy.
    #[must_use]
    pub fn snapshot(&self) -> IndexerStatusSnapshot {
        let last = self.last_processed.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        IndexerStatusSnapshot {
            name: self.name.clone(),
            chain_id: self.chain_id,
            shard_key: self.shard_key.clone(),
            last_processed_block: last,
            head,
            lag_blocks: head.saturating_sub(last),
            enabled: self.enabled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|s| s.clone()),
        }
    }
}

/// A scanned, decoded log ready for ingestion.
#[derive(Debug, Clone)]
pub struct ScannedEvent {
    /// Position of the event within the chain
    pub ctx: EventContext,
    /// Event signature topic (hex string)
    pub topic0: String,
    /// Normalized payload
    pub event: DecodedEvent,
}

/// Outcome of one loop iteration.
#[derive(Debug)]
enum StepOutcome {
    /// Nothing below the confirmed head left to scan.
    CaughtUp,
    /// A range was committed.
    Progressed { to: u64, inserted: usize },
}

/// One long-running log-scanning task; see the module docs for the loop.
pub struct Indexer {
    config: IndexerConfig,
    client: Arc<ChainClient>,
    registry: Arc<DecoderRegistry>,
    repo: Arc<Repository>,
    sink: Arc<dyn EventSink>,
    checkpoint: CheckpointStore,
    events_tx: broadcast::Sender<StoredEvent>,
    status: Arc<IndexerStatus>,
    // topic -> (utc day, malformed count); drives the operator alert
    malformed: Mutex<HashMap<String, (i64, u32)>>,
}

impl Indexer {
    /// Assemble an indexer from its collaborators.
    #[must_use]
    pub fn new(
        config: IndexerConfig,
        client: Arc<ChainClient>,
        registry: Arc<DecoderRegistry>,
        repo: Arc<Repository>,
        sink: Arc<dyn EventSink>,
        enabled: bool,
    ) -> Self {
        let contract_key = format!("{:?}", config.contract).to_lowercase();
        let checkpoint =
            CheckpointStore::new(repo.clone(), config.chain_id, &contract_key, &config.shard_key);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let status = Arc::new(IndexerStatus::new(
            &config.name,
            config.chain_id,
            &config.shard_key,
            enabled,
        ));

        Self {
            config,
            client,
            registry,
            repo,
            sink,
            checkpoint,
            events_tx,
            status,
            malformed: Mutex::new(HashMap::new()),
        }
    }

    /// The shared status cell.
    #[must_use]
    pub fn status(&self) -> Arc<IndexerStatus> {
        self.status.clone()
    }

    /// Subscribe to newly committed events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.events_tx.subscribe()
    }

    /// Run until cancelled. Completes the in-flight iteration before
    /// exiting so the database is never left mid-transaction.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.status.set_running(true);
        let mut batch_blocks = self.config.batch_blocks.max(MIN_BATCH_BLOCKS);

        info!(
            indexer = %self.config.name,
            chain_id = self.config.chain_id,
            shard = %self.config.shard_key,
            "Indexer starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.step(batch_blocks).await {
                Ok(StepOutcome::CaughtUp) => {
                    self.status.clear_error();
                    tokio::select! {
                        () = tokio::time::sleep(self.client.descriptor().idle_delay()) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
                Ok(StepOutcome::Progressed { to, inserted }) => {
                    self.status.clear_error();
                    if inserted > 0 {
                        info!(
                            indexer = %self.config.name,
                            to_block = to,
                            inserted,
                            "Committed event batch"
                        );
                    }
                    batch_blocks = ((batch_blocks / 4) * 5)
                        .max(batch_blocks + 1)
                        .min(self.config.max_batch_blocks)
                        .max(MIN_BATCH_BLOCKS);
                }
                Err(e) if e.is_range_too_wide() => {
                    batch_blocks = (batch_blocks / 2).max(MIN_BATCH_BLOCKS);
                    warn!(
                        indexer = %self.config.name,
                        batch_blocks,
                        "Log query too wide, halving batch"
                    );
                }
                Err(e @ LedgerError::NonMonotonicCheckpoint { .. }) => {
                    error!(indexer = %self.config.name, error = %e, "Checkpoint regression, stopping indexer");
                    self.status.set_error(&e);
                    break;
                }
                Err(e) => {
                    warn!(indexer = %self.config.name, error = %e, "Indexer iteration failed, will retry");
                    self.status.set_error(&e);
                    tokio::select! {
                        () = tokio::time::sleep(self.client.descriptor().idle_delay()) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.status.set_running(false);
        info!(indexer = %self.config.name, "Indexer stopped");
    }

    /// One loop iteration.
    async fn step(&self, batch_blocks: u64) -> LedgerResult<StepOutcome> {
        let last_done = match self.checkpoint.read().await? {
            Some(block) => block,
            None => self.config.start_block.saturating_sub(1),
        };

        let head = self.client.confirmed_head().await?;
        self.status.set_head(head);

        if head <= last_done {
            self.status.set_last_processed(last_done);
            return Ok(StepOutcome::CaughtUp);
        }

        let from = last_done + 1;
        let to = head.min(last_done.saturating_add(batch_blocks));

        let scanned = self.scan_range(from, to).await?;
        let inserted = self.ingest(to, scanned).await?;
        self.status.set_last_processed(to);

        Ok(StepOutcome::Progressed { to, inserted })
    }

    /// Fetch and decode all logs in `[from, to]`.
    ///
    /// Malformed records are skipped with a warning and never block the
    /// range; more than one malformed record per topic per UTC day raises
    /// an operator alert.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors.
    pub async fn scan_range(&self, from: u64, to: u64) -> LedgerResult<Vec<ScannedEvent>> {
        let topics = self
            .registry
            .topics(&self.config.decoder_key)
            .ok_or_else(|| {
                LedgerError::config(
                    format!("unknown decoder key: {}", self.config.decoder_key),
                    None,
                )
            })?;

        let filter = Filter::new()
            .address(self.config.contract)
            .event_signature(topics.to_vec())
            .from_block(from)
            .to_block(to);

        let logs = self.client.get_logs(&filter).await?;
        let mut scanned = Vec::with_capacity(logs.len());

        for log in logs {
            let Some(tx_hash) = log.transaction_hash else {
                warn!(indexer = %self.config.name, "Skipping pending log without transaction hash");
                continue;
            };
            let topic0 = log
                .topic0()
                .map(|t| format!("{t:?}"))
                .unwrap_or_default();

            match self.registry.decode(&self.config.decoder_key, &log) {
                Ok(event) => scanned.push(ScannedEvent {
                    ctx: EventContext {
                        chain_id: self.config.chain_id,
                        tx_hash: format!("{tx_hash:?}"),
                        log_index: log.log_index.unwrap_or(0),
                        block_number: log.block_number.unwrap_or(0),
                        block_timestamp: log
                            .block_timestamp
                            .and_then(|t| i64::try_from(t).ok())
                            .unwrap_or(0),
                    },
                    topic0: topic0.clone(),
                    event,
                }),
                Err(e) => self.note_malformed(&topic0, &e),
            }
        }

        Ok(scanned)
    }

    /// Insert a scanned batch and advance the checkpoint in one
    /// transaction, then broadcast the newly inserted rows.
    ///
    /// # Errors
    ///
    /// Database failures roll the whole iteration back.
    pub async fn ingest(&self, to: u64, scanned: Vec<ScannedEvent>) -> LedgerResult<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.repo.begin().await?;
        let mut fresh = Vec::new();

        for item in scanned {
            let payload = serde_json::to_string(&item.event).map_err(|e| {
                LedgerError::decoding("failed to serialize event payload", Some(Box::new(e)))
            })?;

            let row = RawEventRow {
                chain_id: i64::try_from(item.ctx.chain_id).unwrap_or(i64::MAX),
                tx_hash: item.ctx.tx_hash.clone(),
                log_index: i64::try_from(item.ctx.log_index).unwrap_or(0),
                block_number: i64::try_from(item.ctx.block_number).unwrap_or(0),
                block_timestamp: item.ctx.block_timestamp,
                contract_address: format!("{:?}", self.config.contract).to_lowercase(),
                topic0: item.topic0.clone(),
                stream: item.event.stream().as_str().to_string(),
                payload,
                ingested_at: now,
            };

            if self.repo.insert_event(&mut tx, &row).await? {
                self.sink.apply(&mut tx, &item.ctx, &item.event).await?;
                fresh.push(StoredEvent {
                    chain_id: item.ctx.chain_id,
                    tx_hash: item.ctx.tx_hash,
                    log_index: item.ctx.log_index,
                    block_number: item.ctx.block_number,
                    block_timestamp: item.ctx.block_timestamp,
                    event: item.event,
                });
            }
        }

        self.checkpoint.advance(&mut tx, to, now).await?;

        tx.commit().await.map_err(|e| {
            LedgerError::database("Failed to commit ingestion batch".to_string(), Some(Box::new(e)))
        })?;

        let inserted = fresh.len();
        for event in fresh {
            // Lossy by design: a full buffer drops the oldest messages and
            // consumers catch up from the database.
            let _ = self.events_tx.send(event);
        }

        Ok(inserted)
    }

    fn note_malformed(&self, topic0: &str, err: &LedgerError) {
        let day = chrono::Utc::now().timestamp() / 86_400;
        let count = self.malformed.lock().map_or(1, |mut map| {
            let entry = map.entry(topic0.to_string()).or_insert((day, 0));
            if entry.0 != day {
                *entry = (day, 0);
            }
            entry.1 += 1;
            entry.1
        });

        if count > 1 {
            error!(
                indexer = %self.config.name,
                topic0,
                count,
                error = %err,
                "Repeated malformed records for topic today; operator attention required"
            );
        } else {
            warn!(
                indexer = %self.config.name,
                topic0,
                error = %err,
                "Skipping malformed record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_snapshot_lag() {
        let status = IndexerStatus::new("test", 1, "", true);
        status.set_head(1_000);
        status.set_last_processed(900);

        let snap = status.snapshot();
        assert_eq!(snap.lag_blocks, 100);
        assert!(snap.enabled);
        assert!(!snap.running);
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn test_status_error_round_trip() {
        let status = IndexerStatus::new("test", 1, "", true);
        status.set_error(&LedgerError::rpc_transient("boom", None));
        assert!(status.snapshot().last_error.is_some());
        status.clear_error();
        assert!(status.snapshot().last_error.is_none());
    }

    #[test]
    fn test_batch_growth_is_bounded() {
        // Mirrors the growth expression in run(): 25% growth, clamped.
        let max = 2_000u64;
        let mut batch = 16u64;
        for _ in 0..100 {
            batch = ((batch / 4) * 5)
                .max(batch + 1)
                .min(max)
                .max(MIN_BATCH_BLOCKS);
        }
        assert_eq!(batch, max);
    }
}
