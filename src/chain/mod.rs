//! Uniform chain access for one blockchain.
//!
//! [`ChainClient`] wraps one or more HTTP RPC endpoints for a single chain
//! and exposes the operations the rest of the system needs: chain head, log
//! queries, blocks with transactions, receipts, read-only contract calls and
//! native balances.
//!
//! Per-chain quirks (block time, confirmation depth, endpoint list) live in
//! [`ChainDescriptor`] configuration, not in subclasses; every chain goes
//! through the same code path.
//!
//! # Failure policy
//!
//! Every call is wrapped by the retry policy in [`retry`]: exponential
//! back-off (250 ms, x2, capped at 30 s, max 8 attempts) with a 15 s deadline
//! per attempt. Transient failures rotate through the configured endpoints.
//! The client keeps a per-endpoint health score and avoids endpoints whose
//! failure rate exceeded 50% in the last 60 s.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider as AlloyProvider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Block, BlockTransactionsKind, Filter, Log, TransactionReceipt};
use alloy::transports::http::{Client, Http};
use alloy::transports::TransportError;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};

pub mod retry;

use retry::{rpc_error, RetryPolicy, CALL_DEADLINE, MAX_ATTEMPTS};

/// Type alias for the HTTP provider used throughout the backend.
pub type Provider = RootProvider<Http<Client>>;

/// Static description of one chain: identity, endpoints and timing.
#[derive(Debug, Clone)]
pub struct ChainDescriptor {
    /// EVM chain id
    pub chain_id: u64,
    /// Short human-readable name (e.g. "dfkchain")
    pub name: String,
    /// HTTP RPC endpoints, tried in order with rotation on failure
    pub rpc_urls: Vec<String>,
    /// Decimals of the native coin
    pub native_decimals: u8,
    /// Average seconds between blocks, used for idle sleeps
    pub avg_block_time_secs: u64,
    /// Blocks to stay behind head to avoid reorgs
    pub confirmation_depth: u64,
}

impl ChainDescriptor {
    /// How long an indexer sleeps when caught up to the confirmed head.
    #[must_use]
    pub const fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.avg_block_time_secs * 5)
    }
}

/// Sliding failure window for one endpoint.
///
/// Records call outcomes with timestamps; an endpoint is unhealthy while
/// more than half of the calls in the last 60 s failed.
#[derive(Debug, Default)]
struct HealthWindow {
    outcomes: VecDeque<(Instant, bool)>,
}

/// Window length for the failure-rate calculation.
const HEALTH_WINDOW: Duration = Duration::from_secs(60);

/// Minimum samples before an endpoint can be declared unhealthy.
const MIN_SAMPLES: usize = 4;

impl HealthWindow {
    fn record(&mut self, ok: bool) {
        let now = Instant::now();
        self.outcomes.push_back((now, ok));
        while let Some(&(t, _)) = self.outcomes.front() {
            if now.duration_since(t) > HEALTH_WINDOW {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_healthy(&self) -> bool {
        let now = Instant::now();
        let recent: Vec<bool> = self
            .outcomes
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= HEALTH_WINDOW)
            .map(|&(_, ok)| ok)
            .collect();

        if recent.len() < MIN_SAMPLES {
            return true;
        }

        let failures = recent.iter().filter(|ok| !**ok).count();
        failures * 2 <= recent.len()
    }
}

struct Endpoint {
    url: String,
    provider: Provider,
    health: Mutex<HealthWindow>,
}

/// Uniform access to one chain across multiple RPC endpoints.
pub struct ChainClient {
    descriptor: ChainDescriptor,
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
    policy: RetryPolicy,
}

impl ChainClient {
    /// Build a client from a chain descriptor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the descriptor has no endpoints or
    /// an endpoint URL does not parse.
    pub fn new(descriptor: ChainDescriptor) -> LedgerResult<Self> {
        if descriptor.rpc_urls.is_empty() {
            return Err(LedgerError::config(
                format!("chain {} has no RPC endpoints", descriptor.chain_id),
                None,
            ));
        }

        let mut endpoints = Vec::with_capacity(descriptor.rpc_urls.len());
        for url in &descriptor.rpc_urls {
            let parsed = url.parse().map_err(|e| {
                LedgerError::config(
                    format!("invalid RPC URL for chain {}: {url}", descriptor.chain_id),
                    Some(Box::new(e)),
                )
            })?;
            endpoints.push(Endpoint {
                url: url.clone(),
                provider: ProviderBuilder::new().on_http(parsed),
                health: Mutex::new(HealthWindow::default()),
            });
        }

        Ok(Self {
            descriptor,
            endpoints,
            cursor: AtomicUsize::new(0),
            policy: RetryPolicy::standard(),
        })
    }

    /// Static description of the chain this client serves.
    #[must_use]
    pub const fn descriptor(&self) -> &ChainDescriptor {
        &self.descriptor
    }

    /// Chain id shorthand.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.descriptor.chain_id
    }

    /// Pick the preferred endpoint index: the first healthy one at or after
    /// the rotation cursor, or the cursor itself when none are healthy.
    fn pick_endpoint(&self) -> usize {
        let start = self.cursor.load(Ordering::Relaxed) % self.endpoints.len();
        for offset in 0..self.endpoints.len() {
            let idx = (start + offset) % self.endpoints.len();
            let healthy = self.endpoints[idx]
                .health
                .lock()
                .map(|h| h.is_healthy())
                .unwrap_or(true);
            if healthy {
                return idx;
            }
        }
        start
    }

    fn record_outcome(&self, idx: usize, ok: bool) {
        if let Ok(mut health) = self.endpoints[idx].health.lock() {
            health.record(ok);
        }
    }

    fn rotate(&self) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }

    /// Run `f` against the preferred endpoint, retrying transient failures
    /// with exponential back-off and endpoint rotation.
    ///
    /// Range-too-wide failures are returned after the first attempt so the
    /// indexer can halve its batch; permanent failures propagate immediately.
    ///
    /// # Errors
    ///
    /// The classified [`LedgerError`] of the final attempt.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> LedgerResult<T>
    where
        F: Fn(Provider) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let idx = self.pick_endpoint();
            let provider = self.endpoints[idx].provider.clone();

            let outcome = tokio::time::timeout(CALL_DEADLINE, f(provider)).await;

            match outcome {
                Ok(Ok(value)) => {
                    self.record_outcome(idx, true);
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    self.record_outcome(idx, false);
                    let err = rpc_error(operation, e.to_string());

                    if err.is_range_too_wide() {
                        // Not an endpoint problem; the caller shrinks the
                        // batch and asks again.
                        return Err(err);
                    }
                    if !err.is_transient() {
                        return Err(err);
                    }

                    warn!(
                        chain_id = self.descriptor.chain_id,
                        endpoint = %self.endpoints[idx].url,
                        attempt,
                        error = %err,
                        "Transient RPC failure, rotating endpoint"
                    );
                    last_err = Some(err);
                }
                Err(_) => {
                    self.record_outcome(idx, false);
                    warn!(
                        chain_id = self.descriptor.chain_id,
                        endpoint = %self.endpoints[idx].url,
                        attempt,
                        "RPC call exceeded 15s deadline"
                    );
                    last_err = Some(LedgerError::rpc_transient(
                        format!("{operation}: deadline exceeded"),
                        None,
                    ));
                }
            }

            self.rotate();
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            LedgerError::rpc_transient(format!("{operation}: retries exhausted"), None)
        }))
    }

    /// A clone of the currently preferred endpoint's provider, for typed
    /// contract bindings. Calls made through it bypass the retry wrapper;
    /// callers needing retries wrap their own.
    #[must_use]
    pub fn preferred_provider(&self) -> Provider {
        self.endpoints[self.pick_endpoint()].provider.clone()
    }

    /// Current block number at the head of the chain.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors after retries are exhausted.
    pub async fn head(&self) -> LedgerResult<u64> {
        self.with_retry("eth_blockNumber", |provider| async move {
            provider.get_block_number().await
        })
        .await
    }

    /// Confirmed head: chain head minus the configured confirmation depth.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors after retries are exhausted.
    pub async fn confirmed_head(&self) -> LedgerResult<u64> {
        let head = self.head().await?;
        Ok(head.saturating_sub(self.descriptor.confirmation_depth))
    }

    /// Fetch logs matching `filter`. The result is complete if the call
    /// succeeds; a range-too-wide failure is surfaced for batch shrinking.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors after retries are exhausted.
    pub async fn get_logs(&self, filter: &Filter) -> LedgerResult<Vec<Log>> {
        let filter = filter.clone();
        debug!(chain_id = self.descriptor.chain_id, "eth_getLogs");
        self.with_retry("eth_getLogs", move |provider| {
            let filter = filter.clone();
            async move { provider.get_logs(&filter).await }
        })
        .await
    }

    /// Fetch a block, including its full transaction objects.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors after retries are exhausted.
    pub async fn get_block_with_txs(&self, number: u64) -> LedgerResult<Option<Block>> {
        self.with_retry("eth_getBlockByNumber", move |provider| async move {
            provider
                .get_block_by_number(number.into(), BlockTransactionsKind::Full)
                .await
        })
        .await
    }

    /// Fetch a transaction receipt.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors after retries are exhausted.
    pub async fn get_receipt(&self, tx_hash: B256) -> LedgerResult<Option<TransactionReceipt>> {
        self.with_retry("eth_getTransactionReceipt", move |provider| async move {
            provider.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Native balance of an address in wei.
    ///
    /// # Errors
    ///
    /// Propagates classified RPC errors after retries are exhausted.
    pub async fn balance(&self, address: Address) -> LedgerResult<U256> {
        self.with_retry("eth_getBalance", move |provider| async move {
            provider.get_balance(address).await
        })
        .await
    }
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("chain_id", &self.descriptor.chain_id)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor(urls: Vec<&str>) -> ChainDescriptor {
        ChainDescriptor {
            chain_id: 53935,
            name: "dfkchain".to_string(),
            rpc_urls: urls.into_iter().map(String::from).collect(),
            native_decimals: 18,
            avg_block_time_secs: 2,
            confirmation_depth: 10,
        }
    }

    #[test]
    fn test_client_requires_endpoints() {
        let result = ChainClient::new(test_descriptor(vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let result = ChainClient::new(test_descriptor(vec!["not a url"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_idle_delay_is_five_block_times() {
        let descriptor = test_descriptor(vec!["http://localhost:8545"]);
        assert_eq!(descriptor.idle_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_healthy_window_with_few_samples() {
        let mut window = HealthWindow::default();
        window.record(false);
        window.record(false);
        // Below the sample floor: still considered healthy.
        assert!(window.is_healthy());
    }

    #[test]
    fn test_unhealthy_after_majority_failures() {
        let mut window = HealthWindow::default();
        for _ in 0..3 {
            window.record(false);
        }
        window.record(true);
        window.record(false);
        assert!(!window.is_healthy());
    }

    #[test]
    fn test_recovers_with_successes() {
        let mut window = HealthWindow::default();
        for _ in 0..4 {
            window.record(false);
        }
        assert!(!window.is_healthy());
        for _ in 0..8 {
            window.record(true);
        }
        assert!(window.is_healthy());
    }

    #[test]
    fn test_pick_endpoint_skips_unhealthy() {
        let client = ChainClient::new(test_descriptor(vec![
            "http://localhost:8545",
            "http://localhost:8546",
        ]))
        .unwrap();

        // Mark endpoint 0 unhealthy.
        for _ in 0..6 {
            client.record_outcome(0, false);
        }

        assert_eq!(client.pick_endpoint(), 1);
    }

    #[test]
    fn test_pick_endpoint_falls_back_when_all_unhealthy() {
        let client = ChainClient::new(test_descriptor(vec![
            "http://localhost:8545",
            "http://localhost:8546",
        ]))
        .unwrap();

        for idx in 0..2 {
            for _ in 0..6 {
                client.record_outcome(idx, false);
            }
        }

        // Degraded but still serving: picks the cursor position.
        assert_eq!(client.pick_endpoint(), 0);
    }
}
