//! Periodic jobs and indexer lifecycle management.
//!
//! The scheduler is the only actor that starts and stops indexer tasks.
//! It owns the managed-task registry (log indexers, pool worker sets,
//! native scanners) and drives the periodic jobs:
//!
//! | job | cadence |
//! |---|---|
//! | indexer liveness check | 30 s |
//! | payment expiry sweep | 60 s |
//! | price cache refresh | 5 min |
//! | checkpoint freshness alert | 5 min |
//! | daily wallet snapshot | UTC 00:00 |
//!
//! # Environment gating
//!
//! Indexers auto-start only in production mode. Elsewhere they register
//! disabled and an operator enables each through the admin API, which
//! prevents two dev instances from racing on the same checkpoint rows.
//!
//! # Fatal conditions
//!
//! A database unreachable for over five minutes stops every task; a chain
//! whose endpoints all fail the liveness probe for the same window has its
//! tasks stopped. Both conditions surface through the status API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::db::models::{u256_to_db, WalletSnapshotRow};
use crate::db::repository::Repository;
use crate::error::LedgerResult;
use crate::events::IERC20;
use crate::indexer::native::NativeScanner;
use crate::indexer::steal::PoolWorkerPool;
use crate::indexer::{Indexer, IndexerStatus, IndexerStatusSnapshot};
use crate::pricing::PriceOracle;
use crate::valuation::ValuationEngine;

/// Tasks must exit within this window after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lag above which the freshness alert fires.
const FRESHNESS_THRESHOLD_BLOCKS: u64 = 5_000;

/// Consecutive liveness-probe failures (30 s apart) before a fatal stop;
/// ten misses cover the five-minute window.
const FATAL_PROBE_MISSES: u32 = 10;

/// The concrete task behind a registry entry.
enum TaskKind {
    Log(Arc<Indexer>),
    Pool(Arc<PoolWorkerPool>),
    Native(Arc<NativeScanner>),
}

/// One restartable indexer task plus its identity for admin operations.
pub struct ManagedTask {
    kind: TaskKind,
    status: Arc<IndexerStatus>,
    /// (chain, contract key) scope for checkpoint reset; `None` for tasks
    /// without a resettable cursor.
    checkpoint_scope: Option<(u64, String)>,
    handle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ManagedTask {
    /// Wrap a log indexer.
    #[must_use]
    pub fn log(indexer: Arc<Indexer>, checkpoint_scope: (u64, String)) -> Self {
        Self {
            status: indexer.status(),
            kind: TaskKind::Log(indexer),
            checkpoint_scope: Some(checkpoint_scope),
            handle: Mutex::new(None),
        }
    }

    /// Wrap a pool worker set.
    #[must_use]
    pub fn pool(pool: Arc<PoolWorkerPool>, checkpoint_scope: (u64, String)) -> Self {
        Self {
            status: pool.status(),
            kind: TaskKind::Pool(pool),
            checkpoint_scope: Some(checkpoint_scope),
            handle: Mutex::new(None),
        }
    }

    /// Wrap a native scanner.
    #[must_use]
    pub fn native(scanner: Arc<NativeScanner>, chain_id: u64) -> Self {
        Self {
            status: scanner.status(),
            kind: TaskKind::Native(scanner),
            checkpoint_scope: Some((chain_id, "native".to_string())),
            handle: Mutex::new(None),
        }
    }

    /// The task's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.status.name
    }

    /// The shared status cell.
    #[must_use]
    pub fn status(&self) -> &Arc<IndexerStatus> {
        &self.status
    }

    /// Spawn the task if it is not already running. Idempotent.
    pub fn start(&self, parent: &CancellationToken) {
        let Ok(mut slot) = self.handle.lock() else {
            return;
        };
        if let Some((_, handle)) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let token = parent.child_token();
        let join = match &self.kind {
            TaskKind::Log(indexer) => tokio::spawn(indexer.clone().run(token.clone())),
            TaskKind::Pool(pool) => tokio::spawn(pool.clone().run(token.clone())),
            TaskKind::Native(scanner) => tokio::spawn(scanner.clone().run(token.clone())),
        };
        self.status.set_enabled(true);
        *slot = Some((token, join));
        info!(task = %self.status.name, "Task started");
    }

    /// Cancel the task. Idempotent; the task finishes its in-flight
    /// iteration before exiting.
    pub fn stop(&self) {
        self.status.set_enabled(false);
        if let Ok(slot) = self.handle.lock() {
            if let Some((token, _)) = slot.as_ref() {
                token.cancel();
            }
        }
        info!(task = %self.status.name, "Task stop requested");
    }

    fn is_running(&self) -> bool {
        self.handle
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(_, h)| !h.is_finished()))
            .unwrap_or(false)
    }
}

/// The C9 scheduler; see the module docs.
pub struct Scheduler {
    tasks: Vec<Arc<ManagedTask>>,
    repo: Arc<Repository>,
    oracle: Arc<PriceOracle>,
    valuation: Arc<ValuationEngine>,
    clients: HashMap<u64, Arc<ChainClient>>,
    tracked_wallets: HashMap<u64, Vec<Address>>,
    snapshot_tokens: HashMap<u64, Vec<Address>>,
    production_mode: bool,
    root: CancellationToken,
}

impl Scheduler {
    /// Assemble the scheduler over its collaborators.
    #[must_use]
    pub fn new(
        repo: Arc<Repository>,
        oracle: Arc<PriceOracle>,
        valuation: Arc<ValuationEngine>,
        clients: HashMap<u64, Arc<ChainClient>>,
        tracked_wallets: HashMap<u64, Vec<Address>>,
        snapshot_tokens: HashMap<u64, Vec<Address>>,
        production_mode: bool,
    ) -> Self {
        Self {
            tasks: Vec::new(),
            repo,
            oracle,
            valuation,
            clients,
            tracked_wallets,
            snapshot_tokens,
            production_mode,
            root: CancellationToken::new(),
        }
    }

    /// Register a task. In production mode it starts immediately; in
    /// non-production it waits for an operator.
    pub fn register(&mut self, task: ManagedTask) {
        let task = Arc::new(task);
        if self.production_mode {
            task.start(&self.root);
        } else {
            task.status().set_enabled(false);
            info!(task = %task.name(), "Registered disabled (non-production mode)");
        }
        self.tasks.push(task);
    }

    /// Status snapshots of every registered task.
    #[must_use]
    pub fn snapshots(&self) -> Vec<IndexerStatusSnapshot> {
        self.tasks.iter().map(|t| t.status().snapshot()).collect()
    }

    /// Start a task by name (admin). Returns whether the name resolved.
    #[must_use]
    pub fn start_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| {
            if task.name() == name {
                task.start(&self.root);
                true
            } else {
                false
            }
        })
    }

    /// Stop a task by name (admin). Returns whether the name resolved.
    #[must_use]
    pub fn stop_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| {
            if task.name() == name {
                task.stop();
                true
            } else {
                false
            }
        })
    }

    /// Reset a task by name (admin): stop it, delete its checkpoint rows,
    /// restart. The re-scan is absorbed by the event table's primary key.
    ///
    /// # Errors
    ///
    /// Database failures while deleting the checkpoint.
    pub async fn reset_task(&self, name: &str) -> LedgerResult<bool> {
        for task in &self.tasks {
            if task.name() != name {
                continue;
            }
            task.stop();
            if let Some((chain_id, contract)) = &task.checkpoint_scope {
                let deleted = self.repo.delete_checkpoints(*chain_id, contract).await?;
                info!(task = name, deleted, "Checkpoint reset");
            }
            task.start(&self.root);
            return Ok(true);
        }
        Ok(false)
    }

    /// Run the job loops until `shutdown` fires, then stop every task
    /// within the grace window.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            tasks = self.tasks.len(),
            production = self.production_mode,
            "Scheduler starting"
        );

        let mut jobs: Vec<JoinHandle<()>> = Vec::new();

        {
            let scheduler = self.clone();
            let token = self.root.clone();
            jobs.push(tokio::spawn(async move {
                scheduler.liveness_loop(token).await;
            }));
        }
        {
            let scheduler = self.clone();
            let token = self.root.clone();
            jobs.push(tokio::spawn(async move {
                scheduler.expiry_loop(token).await;
            }));
        }
        {
            let scheduler = self.clone();
            let token = self.root.clone();
            jobs.push(tokio::spawn(async move {
                scheduler.price_refresh_loop(token).await;
            }));
        }
        {
            let scheduler = self.clone();
            let token = self.root.clone();
            jobs.push(tokio::spawn(async move {
                scheduler.freshness_loop(token).await;
            }));
        }
        {
            let scheduler = self.clone();
            let token = self.root.clone();
            jobs.push(tokio::spawn(async move {
                scheduler.snapshot_loop(token).await;
            }));
        }

        shutdown.cancelled().await;
        info!("Scheduler shutting down");

        self.root.cancel();
        for task in &self.tasks {
            task.stop();
        }

        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        for job in jobs {
            tokio::select! {
                _ = job => {}
                () = &mut deadline => {
                    warn!("Shutdown grace period elapsed with jobs still running");
                    break;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Restart crashed-but-enabled tasks; stop everything on fatal
    /// database loss; stop a chain's tasks when it has no healthy
    /// endpoint.
    async fn liveness_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        let mut db_failed_since: Option<Instant> = None;
        let mut chain_misses: HashMap<u64, u32> = HashMap::new();

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            // Database probe drives the fatal stop-all.
            match self.repo.health_check().await {
                Ok(()) => db_failed_since = None,
                Err(e) => {
                    let since = *db_failed_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > Duration::from_secs(300) {
                        error!(error = %e, "Database unreachable for over five minutes, stopping all tasks");
                        for task in &self.tasks {
                            task.stop();
                        }
                        continue;
                    }
                    warn!(error = %e, "Database probe failed");
                }
            }

            // Chain probes drive per-chain stops.
            for (chain_id, client) in &self.clients {
                match client.head().await {
                    Ok(_) => {
                        chain_misses.insert(*chain_id, 0);
                    }
                    Err(e) => {
                        let misses = chain_misses.entry(*chain_id).or_insert(0);
                        *misses += 1;
                        warn!(chain_id, misses, error = %e, "Chain head probe failed");
                        if *misses >= FATAL_PROBE_MISSES {
                            error!(chain_id, "No healthy RPC endpoint, stopping chain tasks");
                            for task in &self.tasks {
                                if task.status().chain_id == *chain_id {
                                    task.stop();
                                }
                            }
                        }
                    }
                }
            }

            // Restart enabled tasks whose join handle finished.
            for task in &self.tasks {
                if task.status().is_enabled() && !task.is_running() {
                    warn!(task = %task.name(), "Task found dead, restarting");
                    task.start(&self.root);
                }
            }
        }
    }

    async fn expiry_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = self.repo.expire_due_requests(now).await {
                warn!(error = %e, "Payment expiry sweep failed");
            }
        }
    }

    async fn price_refresh_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            for chain_id in self.clients.keys() {
                match self.valuation.refresh_pool_states(*chain_id).await {
                    Ok(refreshed) => {
                        if refreshed > 0 {
                            info!(chain_id, refreshed, "Refreshed pool states");
                        }
                    }
                    Err(e) => warn!(chain_id, error = %e, "Pool state refresh failed"),
                }
                match self.oracle.warm_pool_tokens(*chain_id).await {
                    Ok(priced) => {
                        if priced > 0 {
                            info!(chain_id, priced, "Warmed token prices");
                        }
                    }
                    Err(e) => warn!(chain_id, error = %e, "Price warm-up failed"),
                }
            }
        }
    }

    async fn freshness_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            for snapshot in self.snapshots() {
                if snapshot.running && snapshot.lag_blocks > FRESHNESS_THRESHOLD_BLOCKS {
                    warn!(
                        task = %snapshot.name,
                        lag_blocks = snapshot.lag_blocks,
                        "Checkpoint falling behind chain head"
                    );
                }
            }
        }
    }

    /// Sleep until the next UTC midnight, capture balances, repeat.
    async fn snapshot_loop(&self, token: CancellationToken) {
        loop {
            let now = chrono::Utc::now();
            let next_midnight = (now + chrono::Duration::days(1))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map_or(now + chrono::Duration::days(1), |naive| naive.and_utc());
            let wait = (next_midnight - now)
                .to_std()
                .unwrap_or(Duration::from_secs(3_600));

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.capture_wallet_snapshots().await {
                warn!(error = %e, "Daily wallet snapshot failed");
            }
        }
    }

    /// Capture native + key token balances for every tracked wallet.
    ///
    /// # Errors
    ///
    /// Database failures; per-wallet RPC misses are skipped.
    pub async fn capture_wallet_snapshots(&self) -> LedgerResult<usize> {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let now = chrono::Utc::now().timestamp();
        let mut captured = 0;

        for (chain_id, wallets) in &self.tracked_wallets {
            let Some(client) = self.clients.get(chain_id) else {
                continue;
            };
            let tokens = self.snapshot_tokens.get(chain_id).cloned().unwrap_or_default();

            for wallet in wallets {
                let native = match client.balance(*wallet).await {
                    Ok(balance) => balance,
                    Err(e) => {
                        warn!(chain_id, wallet = %wallet, error = %e, "Balance fetch failed, skipping wallet");
                        continue;
                    }
                };

                let mut token_balances = serde_json::Map::new();
                for token in &tokens {
                    let erc20 = IERC20::new(*token, client.preferred_provider());
                    match erc20.balanceOf(*wallet).call().await {
                        Ok(result) => {
                            token_balances.insert(
                                format!("{token:?}").to_lowercase(),
                                serde_json::Value::String(result._0.to_string()),
                            );
                        }
                        Err(e) => {
                            warn!(chain_id, token = %token, error = %e, "Token balance fetch failed");
                        }
                    }
                }

                self.repo
                    .upsert_wallet_snapshot(&WalletSnapshotRow {
                        chain_id: i64::try_from(*chain_id).unwrap_or(i64::MAX),
                        wallet: format!("{wallet:?}").to_lowercase(),
                        as_of_day: day.clone(),
                        native_wei: u256_to_db(native),
                        token_balances: serde_json::Value::Object(token_balances).to_string(),
                        captured_at: now,
                    })
                    .await?;
                captured += 1;
            }
        }

        if captured > 0 {
            info!(captured, day = %day, "Captured daily wallet snapshots");
        }
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_threshold_is_sane() {
        // The alert must not fire on normal confirmation-depth lag.
        assert!(FRESHNESS_THRESHOLD_BLOCKS > 100);
    }

    #[test]
    fn test_fatal_probe_window_covers_five_minutes() {
        // 30 s cadence x misses >= 300 s.
        assert!(u64::from(FATAL_PROBE_MISSES) * 30 >= 300);
    }
}
