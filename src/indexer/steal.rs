//! Work-stealing shard partitioner for pool-staking streams.
//!
//! Log streams sharded by LP pool would otherwise share one block cursor;
//! here each pool's unprocessed interval is split across
//! `workers_per_pool` workers, each scanning its own sub-range with the
//! pool id as an indexed-topic filter.
//!
//! # Stealing
//!
//! A worker that finishes its sub-range examines the remaining workload of
//! its pool-mates and steals half of the slowest donor's interval (largest
//! remaining; ties broken toward the highest worker id). Stealing is
//! serialized by the per-pool partition lock: the donor's range shrinks
//! atomically before the thief starts, so two thieves can never obtain the
//! same blocks. Stealing never crosses pool boundaries.
//!
//! # Failure semantics
//!
//! Workers persist event rows without advancing the pool checkpoint; the
//! checkpoint moves to the round's head only after every worker finished.
//! A worker crash is therefore equivalent to stopping mid-sub-range: the
//! next round recomputes the remaining interval from the checkpoint and
//! re-partitions, and replayed rows are deduplicated by primary key.

use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Filter;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::db::models::RawEventRow;
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};
use crate::events::DecoderRegistry;

use super::checkpoint::CheckpointStore;
use super::sink::{EventContext, EventSink};
use super::IndexerStatus;

/// Smallest remaining interval worth stealing from a donor.
pub const MIN_STEALABLE_BLOCKS: u64 = 32;

/// Inclusive remaining range of one worker.
#[derive(Debug, Clone, Copy)]
struct SubRange {
    next: u64,
    end: u64,
}

impl SubRange {
    const fn remaining(self) -> u64 {
        if self.next > self.end {
            0
        } else {
            self.end - self.next + 1
        }
    }

    const fn empty() -> Self {
        Self { next: 1, end: 0 }
    }
}

/// One pool's block range, partitioned across workers.
///
/// All mutation happens under a single lock, which doubles as the per-pool
/// steal mutex. The lock is held only for cursor arithmetic, never during
/// RPC or database work.
pub struct WorkPartition {
    ranges: Mutex<Vec<SubRange>>,
}

impl WorkPartition {
    /// Split the inclusive range `[from, to]` into `workers` roughly equal
    /// contiguous sub-ranges.
    #[must_use]
    pub fn new(from: u64, to: u64, workers: usize) -> Self {
        let workers = workers.max(1);
        let mut ranges = Vec::with_capacity(workers);

        if from > to {
            ranges.resize(workers, SubRange::empty());
            return Self {
                ranges: Mutex::new(ranges),
            };
        }

        let total = to - from + 1;
        let base = total / workers as u64;
        let extra = total % workers as u64;

        let mut cursor = from;
        for idx in 0..workers as u64 {
            let len = base + u64::from(idx < extra);
            if len == 0 {
                ranges.push(SubRange::empty());
            } else {
                ranges.push(SubRange {
                    next: cursor,
                    end: cursor + len - 1,
                });
                cursor += len;
            }
        }

        Self {
            ranges: Mutex::new(ranges),
        }
    }

    /// Claim up to `max_blocks` from the worker's own range. Returns the
    /// inclusive chunk, or `None` when the range is exhausted.
    pub fn claim(&self, worker: usize, max_blocks: u64) -> Option<(u64, u64)> {
        let mut ranges = self.ranges.lock().ok()?;
        let range = ranges.get_mut(worker)?;
        if range.remaining() == 0 {
            return None;
        }

        let from = range.next;
        let to = range.end.min(from + max_blocks.max(1) - 1);
        range.next = to + 1;
        Some((from, to))
    }

    /// Steal half of the largest pool-mate's remaining range into the
    /// thief's (empty) range. Returns whether anything was stolen.
    pub fn steal(&self, thief: usize, min_stealable: u64) -> bool {
        let Ok(mut ranges) = self.ranges.lock() else {
            return false;
        };
        match ranges.get(thief) {
            Some(range) if range.remaining() == 0 => {}
            _ => return false,
        }

        // Donor: largest remaining range; ties go to the highest worker id.
        let mut donor: Option<usize> = None;
        for (idx, range) in ranges.iter().enumerate() {
            if idx == thief || range.remaining() == 0 {
                continue;
            }
            match donor {
                Some(best) if ranges[best].remaining() > range.remaining() => {}
                _ => donor = Some(idx),
            }
        }

        let Some(donor) = donor else {
            return false;
        };

        let remaining = ranges[donor].remaining();
        if remaining < min_stealable {
            return false;
        }

        let take = remaining / 2;
        if take == 0 {
            return false;
        }

        let donor_end = ranges[donor].end;
        ranges[donor].end = donor_end - take;
        ranges[thief] = SubRange {
            next: donor_end - take + 1,
            end: donor_end,
        };
        true
    }

    /// Remaining blocks across all workers.
    #[must_use]
    pub fn total_remaining(&self) -> u64 {
        self.ranges
            .lock()
            .map(|ranges| ranges.iter().map(|r| r.remaining()).sum())
            .unwrap_or(0)
    }
}

/// Scans one pool's logs over one block range and persists the results
/// (without advancing the pool checkpoint).
#[axum::async_trait]
pub trait RangeScanner: Send + Sync {
    /// Scan `[from, to]` for `pool_id` and persist what is found.
    ///
    /// # Errors
    ///
    /// RPC or database failures abort the worker; the round's checkpoint
    /// is then withheld and the range re-scanned next round.
    async fn scan(&self, pool_id: u64, from: u64, to: u64) -> LedgerResult<()>;
}

/// Run one pool's catch-up: partition `[from, to]` across workers, let
/// them claim chunks and steal from each other until nothing remains.
///
/// # Errors
///
/// Returns the first worker error; the caller must not advance the pool
/// checkpoint in that case.
#[allow(clippy::too_many_arguments)]
pub async fn run_pool_catchup(
    pool_id: u64,
    from: u64,
    to: u64,
    workers: usize,
    chunk_blocks: u64,
    min_stealable: u64,
    scanner: Arc<dyn RangeScanner>,
    shutdown: CancellationToken,
) -> LedgerResult<()> {
    let partition = Arc::new(WorkPartition::new(from, to, workers));
    let mut set: JoinSet<LedgerResult<u64>> = JoinSet::new();

    for worker in 0..workers {
        let partition = partition.clone();
        let scanner = scanner.clone();
        let shutdown = shutdown.clone();
        set.spawn(async move {
            let mut processed = 0u64;
            loop {
                if shutdown.is_cancelled() {
                    return Ok(processed);
                }
                if let Some((chunk_from, chunk_to)) = partition.claim(worker, chunk_blocks) {
                    scanner.scan(pool_id, chunk_from, chunk_to).await?;
                    processed += chunk_to - chunk_from + 1;
                } else if !partition.steal(worker, min_stealable) {
                    debug!(pool_id, worker, processed, "Worker exhausted, exiting");
                    return Ok(processed);
                }
            }
        });
    }

    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert(LedgerError::state(
                    format!("pool worker panicked or was aborted: {e}"),
                    None,
                ));
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    if shutdown.is_cancelled() && partition.total_remaining() > 0 {
        return Err(LedgerError::state(
            "shutdown interrupted pool catch-up".to_string(),
            None,
        ));
    }

    Ok(())
}

/// Discover a master contract's pools and upsert their descriptors.
///
/// Walks `poolLength`/`poolInfo`, resolving each LP token's pair sides.
/// Returns the number of pools upserted; individual failures are skipped
/// so a flaky pool never blocks the rest.
///
/// # Errors
///
/// Database failures, or a permanent failure reading `poolLength`.
pub async fn discover_pools(
    client: &ChainClient,
    repo: &Repository,
    master: Address,
    version: &str,
) -> LedgerResult<usize> {
    use crate::events::{IMasterGardener, IUniswapV2Pair};

    let provider = client.preferred_provider();
    let gardener = IMasterGardener::new(master, provider.clone());

    let length = gardener
        .poolLength()
        .call()
        .await
        .map_err(|e| crate::chain::retry::rpc_error("poolLength", e.to_string()))?
        ._0;
    let length = u64::try_from(length).unwrap_or(0);

    let mut discovered = 0;
    for pool_id in 0..length {
        let info = match gardener.poolInfo(U256::from(pool_id)).call().await {
            Ok(info) => info,
            Err(e) => {
                warn!(pool_id, error = %e, "poolInfo failed, skipping pool");
                continue;
            }
        };

        let pair = IUniswapV2Pair::new(info.lpToken, provider.clone());
        let (token0, token1) = match (pair.token0().call().await, pair.token1().call().await) {
            (Ok(t0), Ok(t1)) => (t0._0, t1._0),
            _ => {
                // Not every pool stakes a pair token (single-sided pools);
                // those are recorded with the LP token on both sides.
                (info.lpToken, info.lpToken)
            }
        };

        repo.upsert_pool_descriptor(&crate::db::models::PoolDescriptorRow {
            chain_id: i64::try_from(client.chain_id()).unwrap_or(i64::MAX),
            pool_id: i64::try_from(pool_id).unwrap_or(0),
            lp_token: format!("{:?}", info.lpToken).to_lowercase(),
            token0: format!("{token0:?}").to_lowercase(),
            token1: format!("{token1:?}").to_lowercase(),
            master_contract: format!("{master:?}").to_lowercase(),
            version: version.to_string(),
        })
        .await?;
        discovered += 1;
    }

    info!(
        chain_id = client.chain_id(),
        master = %master,
        discovered,
        "Pool discovery complete"
    );
    Ok(discovered)
}

/// Production [`RangeScanner`]: per-pool topic filter, adaptive splitting
/// on too-wide ranges, transactional persistence through the sink.
pub struct GardenRangeScanner {
    client: Arc<ChainClient>,
    registry: Arc<DecoderRegistry>,
    repo: Arc<Repository>,
    sink: Arc<dyn EventSink>,
    contract: Address,
    decoder_key: String,
}

impl GardenRangeScanner {
    /// Assemble a scanner for one master contract.
    #[must_use]
    pub fn new(
        client: Arc<ChainClient>,
        registry: Arc<DecoderRegistry>,
        repo: Arc<Repository>,
        sink: Arc<dyn EventSink>,
        contract: Address,
        decoder_key: String,
    ) -> Self {
        Self {
            client,
            registry,
            repo,
            sink,
            contract,
            decoder_key,
        }
    }

    async fn scan_once(&self, pool_id: u64, from: u64, to: u64) -> LedgerResult<()> {
        let topics = self.registry.topics(&self.decoder_key).ok_or_else(|| {
            LedgerError::config(format!("unknown decoder key: {}", self.decoder_key), None)
        })?;

        // The pool id is the second indexed parameter on every gardener
        // event, so the filter narrows server-side to this shard.
        let pid_topic = B256::from(U256::from(pool_id).to_be_bytes::<32>());
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(topics.to_vec())
            .topic2(pid_topic)
            .from_block(from)
            .to_block(to);

        let logs = self.client.get_logs(&filter).await?;
        if logs.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.repo.begin().await?;

        for log in logs {
            let Some(tx_hash) = log.transaction_hash else {
                continue;
            };
            let topic0 = log.topic0().map(|t| format!("{t:?}")).unwrap_or_default();

            let event = match self.registry.decode(&self.decoder_key, &log) {
                Ok(event) => event,
                Err(e) => {
                    warn!(pool_id, error = %e, "Skipping malformed sharded record");
                    continue;
                }
            };

            let ctx = EventContext {
                chain_id: self.client.chain_id(),
                tx_hash: format!("{tx_hash:?}"),
                log_index: log.log_index.unwrap_or(0),
                block_number: log.block_number.unwrap_or(0),
                block_timestamp: log
                    .block_timestamp
                    .and_then(|t| i64::try_from(t).ok())
                    .unwrap_or(0),
            };

            let payload = serde_json::to_string(&event).map_err(|e| {
                LedgerError::decoding("failed to serialize event payload", Some(Box::new(e)))
            })?;

            let row = RawEventRow {
                chain_id: i64::try_from(ctx.chain_id).unwrap_or(i64::MAX),
                tx_hash: ctx.tx_hash.clone(),
                log_index: i64::try_from(ctx.log_index).unwrap_or(0),
                block_number: i64::try_from(ctx.block_number).unwrap_or(0),
                block_timestamp: ctx.block_timestamp,
                contract_address: format!("{:?}", self.contract).to_lowercase(),
                topic0,
                stream: event.stream().as_str().to_string(),
                payload,
                ingested_at: now,
            };

            if self.repo.insert_event(&mut tx, &row).await? {
                self.sink.apply(&mut tx, &ctx, &event).await?;
            }
        }

        tx.commit().await.map_err(|e| {
            LedgerError::database("Failed to commit sharded batch".to_string(), Some(Box::new(e)))
        })?;

        Ok(())
    }
}

#[axum::async_trait]
impl RangeScanner for GardenRangeScanner {
    async fn scan(&self, pool_id: u64, from: u64, to: u64) -> LedgerResult<()> {
        // Split too-wide ranges in half until the endpoint accepts them.
        let mut stack = vec![(from, to)];
        while let Some((a, b)) = stack.pop() {
            match self.scan_once(pool_id, a, b).await {
                Ok(()) => {}
                Err(e) if e.is_range_too_wide() && b > a => {
                    let mid = a + (b - a) / 2;
                    stack.push((mid + 1, b));
                    stack.push((a, mid));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The C4 driver: one per master contract, running every pool's catch-up
/// round concurrently and advancing each pool's checkpoint when its round
/// completes.
pub struct PoolWorkerPool {
    client: Arc<ChainClient>,
    repo: Arc<Repository>,
    scanner: Arc<dyn RangeScanner>,
    contract: Address,
    start_block: u64,
    workers_per_pool: usize,
    chunk_blocks: u64,
    status: Arc<IndexerStatus>,
}

impl PoolWorkerPool {
    /// Assemble the driver for one master contract.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        client: Arc<ChainClient>,
        repo: Arc<Repository>,
        scanner: Arc<dyn RangeScanner>,
        contract: Address,
        start_block: u64,
        workers_per_pool: usize,
        chunk_blocks: u64,
        enabled: bool,
    ) -> Self {
        let chain_id = client.chain_id();
        Self {
            client,
            repo,
            scanner,
            contract,
            start_block,
            workers_per_pool,
            chunk_blocks,
            status: Arc::new(IndexerStatus::new(name, chain_id, "*", enabled)),
        }
    }

    /// The shared status cell.
    #[must_use]
    pub fn status(&self) -> Arc<IndexerStatus> {
        self.status.clone()
    }

    /// Run rounds until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.status.set_running(true);
        info!(contract = %self.contract, "Pool worker set starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.round(&shutdown).await {
                Ok(()) => self.status.clear_error(),
                Err(e) => {
                    warn!(contract = %self.contract, error = %e, "Pool round failed, will retry");
                    self.status.set_error(&e);
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.client.descriptor().idle_delay()) => {}
                () = shutdown.cancelled() => break,
            }
        }

        self.status.set_running(false);
        info!(contract = %self.contract, "Pool worker set stopped");
    }

    /// One catch-up round over all pools of this master contract.
    async fn round(&self, shutdown: &CancellationToken) -> LedgerResult<()> {
        let head = self.client.confirmed_head().await?;
        self.status.set_head(head);

        let contract_key = format!("{:?}", self.contract).to_lowercase();
        let pools: Vec<u64> = self
            .repo
            .list_pool_descriptors(Some(self.client.chain_id()))
            .await?
            .into_iter()
            .filter(|p| p.master_contract == contract_key)
            .map(|p| u64::try_from(p.pool_id).unwrap_or(0))
            .collect();

        if pools.is_empty() {
            return Ok(());
        }

        let mut set: JoinSet<LedgerResult<u64>> = JoinSet::new();
        for pool_id in pools {
            let repo = self.repo.clone();
            let scanner = self.scanner.clone();
            let shutdown = shutdown.clone();
            let contract_key = contract_key.clone();
            let chain_id = self.client.chain_id();
            let start_block = self.start_block;
            let workers = self.workers_per_pool;
            let chunk = self.chunk_blocks;

            set.spawn(async move {
                let checkpoint =
                    CheckpointStore::new(repo.clone(), chain_id, &contract_key, &pool_id.to_string());
                let last = match checkpoint.read().await? {
                    Some(block) => block,
                    None => start_block.saturating_sub(1),
                };
                if head <= last {
                    return Ok(last);
                }

                run_pool_catchup(
                    pool_id,
                    last + 1,
                    head,
                    workers,
                    chunk,
                    MIN_STEALABLE_BLOCKS,
                    scanner,
                    shutdown,
                )
                .await?;

                let now = chrono::Utc::now().timestamp();
                let mut tx = repo.begin().await?;
                checkpoint.advance(&mut tx, head, now).await?;
                tx.commit().await.map_err(|e| {
                    LedgerError::database(
                        "Failed to commit pool checkpoint".to_string(),
                        Some(Box::new(e)),
                    )
                })?;
                Ok(head)
            });
        }

        let mut first_err = None;
        let mut min_frontier = head;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(frontier)) => min_frontier = min_frontier.min(frontier),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(LedgerError::state(
                        format!("pool round task failed: {e}"),
                        None,
                    ));
                }
            }
        }

        self.status.set_last_processed(min_frontier);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_splits_evenly() {
        let partition = WorkPartition::new(0, 299, 3);
        assert_eq!(partition.total_remaining(), 300);

        // Each worker owns a contiguous third.
        assert_eq!(partition.claim(0, 1_000), Some((0, 99)));
        assert_eq!(partition.claim(1, 1_000), Some((100, 199)));
        assert_eq!(partition.claim(2, 1_000), Some((200, 299)));
        assert_eq!(partition.total_remaining(), 0);
    }

    #[test]
    fn test_partition_with_remainder() {
        let partition = WorkPartition::new(1, 10, 3);
        assert_eq!(partition.claim(0, 100), Some((1, 4)));
        assert_eq!(partition.claim(1, 100), Some((5, 7)));
        assert_eq!(partition.claim(2, 100), Some((8, 10)));
    }

    #[test]
    fn test_empty_partition() {
        let partition = WorkPartition::new(10, 9, 3);
        assert_eq!(partition.total_remaining(), 0);
        assert_eq!(partition.claim(0, 100), None);
    }

    #[test]
    fn test_claim_respects_chunk_size() {
        let partition = WorkPartition::new(0, 99, 1);
        assert_eq!(partition.claim(0, 25), Some((0, 24)));
        assert_eq!(partition.claim(0, 25), Some((25, 49)));
        assert_eq!(partition.total_remaining(), 50);
    }

    #[test]
    fn test_steal_takes_half_of_largest_donor() {
        // The donor-reservation scenario: three workers over [0, 300).
        let partition = WorkPartition::new(0, 299, 3);

        // W1 finishes immediately; W2 progresses to 120, W3 to 210.
        assert_eq!(partition.claim(0, 1_000), Some((0, 99)));
        assert_eq!(partition.claim(1, 20), Some((100, 119)));
        assert_eq!(partition.claim(2, 10), Some((200, 209)));

        // W2 has 80 remaining, W3 has 90: W3 is the donor, half is 45.
        assert!(partition.steal(0, 1));
        assert_eq!(partition.claim(0, 1_000), Some((255, 299)));

        // The donor's range shrank atomically: W3 now ends at 254.
        assert_eq!(partition.claim(2, 1_000), Some((210, 254)));

        // W1 may steal again, now from W2.
        assert!(partition.steal(0, 1));
        assert_eq!(partition.claim(0, 1_000), Some((160, 199)));
        assert_eq!(partition.claim(1, 1_000), Some((120, 159)));

        // Every block handed out exactly once.
        assert_eq!(partition.total_remaining(), 0);
    }

    #[test]
    fn test_steal_tie_breaks_to_highest_worker_id() {
        let partition = WorkPartition::new(0, 299, 3);
        assert_eq!(partition.claim(0, 1_000), Some((0, 99)));

        // W2 and W3 both have 100 remaining; donor must be W3 (higher id).
        assert!(partition.steal(0, 1));
        assert_eq!(partition.claim(0, 1_000), Some((250, 299)));
    }

    #[test]
    fn test_steal_requires_min_stealable() {
        let partition = WorkPartition::new(0, 29, 2);
        assert_eq!(partition.claim(0, 1_000), Some((0, 14)));

        // Donor has 15 remaining, below the floor of 32.
        assert!(!partition.steal(0, MIN_STEALABLE_BLOCKS));
    }

    #[test]
    fn test_worker_with_work_cannot_steal() {
        let partition = WorkPartition::new(0, 99, 2);
        // W0 still owns [0, 49]; it must drain before stealing.
        assert!(!partition.steal(0, 1));
    }

    struct RecordingScanner {
        seen: Mutex<Vec<(u64, u64)>>,
    }

    #[axum::async_trait]
    impl RangeScanner for RecordingScanner {
        async fn scan(&self, _pool_id: u64, from: u64, to: u64) -> LedgerResult<()> {
            // Tiny variable delay so claims interleave across workers.
            tokio::time::sleep(std::time::Duration::from_millis(from % 3)).await;
            self.seen.lock().map_or((), |mut seen| seen.push((from, to)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_catchup_covers_range_exactly_once() {
        let scanner = Arc::new(RecordingScanner {
            seen: Mutex::new(Vec::new()),
        });

        run_pool_catchup(
            7,
            0,
            299,
            3,
            17,
            1,
            scanner.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut covered = vec![false; 300];
        let seen = scanner.seen.lock().unwrap().clone();
        for (from, to) in seen {
            for block in from..=to {
                let slot = &mut covered[usize::try_from(block).unwrap()];
                assert!(!*slot, "block {block} scanned twice");
                *slot = true;
            }
        }
        assert!(covered.iter().all(|c| *c), "every block scanned");
    }

    struct FailingScanner;

    #[axum::async_trait]
    impl RangeScanner for FailingScanner {
        async fn scan(&self, _pool_id: u64, from: u64, _to: u64) -> LedgerResult<()> {
            if from >= 150 {
                return Err(LedgerError::rpc_transient("scan failed", None));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_catchup_surfaces_worker_failure() {
        let result = run_pool_catchup(
            7,
            0,
            299,
            3,
            50,
            1,
            Arc::new(FailingScanner),
            CancellationToken::new(),
        )
        .await;

        // The caller must withhold the checkpoint advance.
        assert!(result.is_err());
    }
}
