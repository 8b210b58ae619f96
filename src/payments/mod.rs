//! Payment matching: reconciling observed transfers against pending
//! requests.
//!
//! The matcher is a passive consumer of the transfer stream (ERC-20 logs to
//! the custodial wallet plus synthetic native transfers from the native
//! scanner). Each observed transfer is tried against all live `PENDING`
//! requests with a fixed strategy priority:
//!
//! 1. `UNIQUE_EXACT` — exact match on the perturbed unique amount
//! 2. `REQUESTED_EXACT` — exact match on the nominal amount
//! 3. `UNIQUE_TOLERANCE` — unique amount within 1 wei
//! 4. `WALLET_AMOUNT` — bound sender within 0.1 display units
//!
//! A match transitions the request `PENDING -> MATCHED` transactionally
//! with the `MatchedTransfer` insert, then emits a [`PaymentMatched`]
//! notification. Non-matching transfers are logged and never fail
//! ingestion. Ambiguous contract states fail closed: no match on error.
//!
//! # Unique amounts
//!
//! Request creation perturbs the low-order wei of the expected amount until
//! the value is unused by any live pending request of the same kind, which
//! is what makes strategy 1 deterministic even when two players request the
//! same nominal amount in the same window.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::models::{
    u256_to_db, MatchStrategy, MatchedTransferRow, PaymentKind, PaymentRequestRow, PaymentStatus,
};
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};
use crate::events::DecodedEvent;
use crate::indexer::StoredEvent;

/// Decimals of the payment token and native coin; both are 18 on every
/// covered chain.
pub const PAYMENT_DECIMALS: u8 = 18;

/// Strategy-3 tolerance: one wei, absorbing RPC rounding.
const UNIQUE_TOLERANCE_WEI: u64 = 1;

/// Strategy-4 tolerance: 0.1 display units in wei.
fn wallet_tolerance_wei() -> U256 {
    U256::from(10u64).pow(U256::from(u64::from(PAYMENT_DECIMALS) - 1))
}

fn abs_diff(a: U256, b: U256) -> U256 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Notification emitted when a request is matched.
#[derive(Debug, Clone)]
pub struct PaymentMatched {
    /// Matched request id
    pub request_id: String,
    /// Owning player
    pub player_id: String,
    /// Matching transfer hash
    pub tx_hash: String,
    /// Observed amount in wei
    pub amount: U256,
    /// Which strategy matched
    pub strategy: MatchStrategy,
}

/// An observed inbound transfer, normalized across ERC-20 and native.
#[derive(Debug, Clone)]
pub struct ObservedTransfer {
    /// Sender wallet
    pub from: Address,
    /// Amount in wei
    pub amount: U256,
    /// Transaction hash (hex string)
    pub tx_hash: String,
    /// Block the transfer landed in
    pub block_number: u64,
}

/// A freshly created request, handed back to the command layer which
/// instructs the player what to send.
#[derive(Debug, Clone)]
pub struct CreatedRequest {
    /// Request id
    pub id: String,
    /// The exact amount the player must send
    pub unique_amount: U256,
    /// Unix expiry time
    pub expires_at: i64,
}

/// The payment matcher; see the module docs for the algorithm.
pub struct PaymentMatcher {
    repo: Arc<Repository>,
    custodial_wallet: Address,
    payment_token: Option<Address>,
    matched_tx: broadcast::Sender<PaymentMatched>,
}

impl PaymentMatcher {
    /// Create a matcher for one chain's custodial wallet.
    ///
    /// `payment_token` restricts which ERC-20 contract counts as payment;
    /// `None` accepts any token's transfers to the wallet.
    #[must_use]
    pub fn new(
        repo: Arc<Repository>,
        custodial_wallet: Address,
        payment_token: Option<Address>,
    ) -> Self {
        let (matched_tx, _) = broadcast::channel(256);
        Self {
            repo,
            custodial_wallet,
            payment_token,
            matched_tx,
        }
    }

    /// Subscribe to match notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PaymentMatched> {
        self.matched_tx.subscribe()
    }

    /// Consume a transfer stream until cancelled.
    ///
    /// The broadcast buffer is lossy; on lag the matcher re-reads recent
    /// transfer rows from the database instead of trusting the stream.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<StoredEvent>,
        shutdown: CancellationToken,
    ) {
        info!(wallet = %self.custodial_wallet, "Payment matcher starting");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Some(observed) = self.observed_from_event(&event) {
                            if let Err(e) = self.handle_transfer(&observed).await {
                                warn!(error = %e, tx_hash = %observed.tx_hash, "Transfer match attempt failed");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Matcher lagged behind the stream, re-reading from database");
                        if let Err(e) = self.catch_up().await {
                            warn!(error = %e, "Matcher catch-up failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        info!("Payment matcher stopped");
    }

    /// Extract an inbound payment from a stored event, if it is one.
    fn observed_from_event(&self, event: &StoredEvent) -> Option<ObservedTransfer> {
        match &event.event {
            DecodedEvent::Erc20Transfer {
                token,
                from,
                to,
                amount,
            } if *to == self.custodial_wallet => {
                if let Some(expected_token) = self.payment_token {
                    if *token != expected_token {
                        return None;
                    }
                }
                Some(ObservedTransfer {
                    from: *from,
                    amount: *amount,
                    tx_hash: event.tx_hash.clone(),
                    block_number: event.block_number,
                })
            }
            DecodedEvent::NativeTransfer { from, to, amount }
                if *to == self.custodial_wallet =>
            {
                Some(ObservedTransfer {
                    from: *from,
                    amount: *amount,
                    tx_hash: event.tx_hash.clone(),
                    block_number: event.block_number,
                })
            }
            _ => None,
        }
    }

    /// Re-scan recent transfer rows after stream loss.
    async fn catch_up(&self) -> LedgerResult<()> {
        let rows = self.repo.events_by_stream("transfers", 500).await?;
        for row in rows {
            let event: DecodedEvent = match serde_json::from_str(&row.payload) {
                Ok(event) => event,
                Err(_) => continue,
            };
            let stored = StoredEvent {
                chain_id: u64::try_from(row.chain_id).unwrap_or(0),
                tx_hash: row.tx_hash,
                log_index: u64::try_from(row.log_index).unwrap_or(0),
                block_number: u64::try_from(row.block_number).unwrap_or(0),
                block_timestamp: row.block_timestamp,
                event,
            };
            if let Some(observed) = self.observed_from_event(&stored) {
                if let Err(e) = self.handle_transfer(&observed).await {
                    warn!(error = %e, tx_hash = %observed.tx_hash, "Catch-up match attempt failed");
                }
            }
        }
        Ok(())
    }

    /// Try to match one observed transfer. Returns the strategy that
    /// matched, or `None` for an unmatched transfer.
    ///
    /// # Errors
    ///
    /// Database failures; a conflicting concurrent match surfaces as a
    /// [`LedgerError::PaymentConflict`].
    pub async fn handle_transfer(
        &self,
        observed: &ObservedTransfer,
    ) -> LedgerResult<Option<MatchStrategy>> {
        if self.repo.matched_transfer_exists(&observed.tx_hash).await? {
            return Ok(None);
        }

        let now = chrono::Utc::now().timestamp();
        let pending = self.repo.pending_requests(now).await?;

        let Some((request, strategy)) = self.select_match(observed, &pending)? else {
            info!(
                from = %observed.from,
                amount = %observed.amount,
                pending = pending.len(),
                tx_hash = %observed.tx_hash,
                "Transfer matched no pending request"
            );
            return Ok(None);
        };

        let transfer = MatchedTransferRow {
            request_id: request.id.clone(),
            tx_hash: observed.tx_hash.clone(),
            block_number: i64::try_from(observed.block_number).unwrap_or(0),
            from_address: format!("{:?}", observed.from).to_lowercase(),
            amount_wei: u256_to_db(observed.amount),
            match_strategy: strategy.as_str().to_string(),
            matched_at: now,
        };
        self.repo.record_match(&transfer).await?;

        info!(
            request_id = %request.id,
            player_id = %request.player_id,
            strategy = strategy.as_str(),
            tx_hash = %observed.tx_hash,
            "Payment matched"
        );

        let _ = self.matched_tx.send(PaymentMatched {
            request_id: request.id.clone(),
            player_id: request.player_id.clone(),
            tx_hash: observed.tx_hash.clone(),
            amount: observed.amount,
            strategy,
        });

        Ok(Some(strategy))
    }

    /// Apply the strategy priority over the pending set.
    fn select_match<'a>(
        &self,
        observed: &ObservedTransfer,
        pending: &'a [PaymentRequestRow],
    ) -> LedgerResult<Option<(&'a PaymentRequestRow, MatchStrategy)>> {
        let from_key = format!("{:?}", observed.from).to_lowercase();
        let tolerance = U256::from(UNIQUE_TOLERANCE_WEI);
        let wallet_tolerance = wallet_tolerance_wei();

        // Candidate predicates in priority order; first strategy with any
        // hit wins, oldest request first within a strategy.
        type Predicate<'p> = Box<dyn Fn(&PaymentRequestRow) -> LedgerResult<bool> + 'p>;
        let strategies: [(MatchStrategy, Predicate<'_>); 4] = [
            (
                MatchStrategy::UniqueExact,
                Box::new(|r| Ok(observed.amount == r.unique_amount()?)),
            ),
            (
                MatchStrategy::RequestedExact,
                Box::new(|r| Ok(observed.amount == r.expected_amount()?)),
            ),
            (
                MatchStrategy::UniqueTolerance,
                Box::new(move |r| Ok(abs_diff(observed.amount, r.unique_amount()?) <= tolerance)),
            ),
            (
                MatchStrategy::WalletAmount,
                Box::new(move |r| {
                    Ok(r.from_wallet.as_deref() == Some(from_key.as_str())
                        && abs_diff(observed.amount, r.expected_amount()?) <= wallet_tolerance)
                }),
            ),
        ];

        for (strategy, predicate) in &strategies {
            let mut hits = Vec::new();
            for request in pending {
                if predicate(request)? {
                    hits.push(request);
                }
            }
            if let Some(first) = hits.first().copied() {
                if hits.len() > 1 {
                    warn!(
                        strategy = strategy.as_str(),
                        candidates = hits.len(),
                        chosen = %first.id,
                        "Ambiguous payment match, choosing oldest request"
                    );
                }
                return Ok(Some((first, *strategy)));
            }
        }

        Ok(None)
    }
}

/// Create a payment request with a perturbed unique amount.
///
/// The caller supplies the nominal `expected_amount`; the low-order wei are
/// randomized until the value is unused among live pending requests of the
/// same kind.
///
/// # Errors
///
/// Database failures, or exhaustion of the perturbation space (256
/// attempts), which indicates a saturated request window.
pub async fn create_request(
    repo: &Repository,
    player_id: &str,
    kind: PaymentKind,
    expected_amount: U256,
    from_wallet: Option<Address>,
    ttl: Duration,
) -> LedgerResult<CreatedRequest> {
    let now = chrono::Utc::now().timestamp();
    let expires_at = now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

    let mut unique_amount = None;
    for _ in 0..256 {
        let offset = rand::thread_rng().gen_range(1u64..1_000);
        let candidate = expected_amount.saturating_add(U256::from(offset));
        if !repo.unique_amount_in_use(kind, candidate, now).await? {
            unique_amount = Some(candidate);
            break;
        }
    }
    let unique_amount = unique_amount.ok_or_else(|| {
        LedgerError::state(
            "could not find an unused unique amount; request window saturated",
            None,
        )
    })?;

    let id = format!("{:032x}", rand::thread_rng().gen::<u128>());
    let row = PaymentRequestRow {
        id: id.clone(),
        player_id: player_id.to_string(),
        kind: kind.as_str().to_string(),
        status: PaymentStatus::Pending.as_str().to_string(),
        from_wallet: from_wallet.map(|w| format!("{w:?}").to_lowercase()),
        expected_amount_wei: u256_to_db(expected_amount),
        unique_amount_wei: u256_to_db(unique_amount),
        expires_at,
        created_at: now,
        matched_tx_hash: None,
        matched_at: None,
    };
    repo.insert_payment_request(&row).await?;

    info!(
        request_id = %id,
        player_id,
        kind = kind.as_str(),
        expires_at,
        "Created payment request"
    );

    Ok(CreatedRequest {
        id,
        unique_amount,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    fn ten_with_wei(extra: u64) -> U256 {
        U256::from(10u64) * U256::from(10u64).pow(U256::from(18u64)) + U256::from(extra)
    }

    async fn setup() -> Arc<Repository> {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        Arc::new(Repository::new(pool))
    }

    fn request(
        id: &str,
        expected: U256,
        unique: U256,
        from_wallet: Option<&str>,
        expires_at: i64,
    ) -> PaymentRequestRow {
        PaymentRequestRow {
            id: id.to_string(),
            player_id: "player-1".to_string(),
            kind: "DEPOSIT".to_string(),
            status: "PENDING".to_string(),
            from_wallet: from_wallet.map(str::to_string),
            expected_amount_wei: u256_to_db(expected),
            unique_amount_wei: u256_to_db(unique),
            expires_at,
            created_at: 0,
            matched_tx_hash: None,
            matched_at: None,
        }
    }

    fn matcher(repo: Arc<Repository>) -> PaymentMatcher {
        PaymentMatcher::new(repo, Address::repeat_byte(0xcc), None)
    }

    fn observed(from: Address, amount: U256, tx: &str) -> ObservedTransfer {
        ObservedTransfer {
            from,
            amount,
            tx_hash: tx.to_string(),
            block_number: 100,
        }
    }

    #[tokio::test]
    async fn test_unique_exact_match() {
        let repo = setup().await;
        let far_future = chrono::Utc::now().timestamp() + 7_200;
        repo.insert_payment_request(&request(
            "r1",
            ten_with_wei(0),
            ten_with_wei(347),
            Some("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            far_future,
        ))
        .await
        .unwrap();

        let m = matcher(repo.clone());
        let strategy = m
            .handle_transfer(&observed(
                Address::repeat_byte(0xaa),
                ten_with_wei(347),
                "0xtx1",
            ))
            .await
            .unwrap();

        assert_eq!(strategy, Some(MatchStrategy::UniqueExact));
        let row = repo.get_payment_request("r1").await.unwrap().unwrap();
        assert_eq!(row.status, "MATCHED");
        assert_eq!(row.matched_tx_hash.as_deref(), Some("0xtx1"));
    }

    #[tokio::test]
    async fn test_unique_tolerance_absorbs_one_wei() {
        let repo = setup().await;
        let far_future = chrono::Utc::now().timestamp() + 7_200;
        repo.insert_payment_request(&request(
            "r1",
            ten_with_wei(0),
            ten_with_wei(347),
            None,
            far_future,
        ))
        .await
        .unwrap();

        let m = matcher(repo.clone());
        // One wei short of the unique amount.
        let strategy = m
            .handle_transfer(&observed(
                Address::repeat_byte(0xaa),
                ten_with_wei(346),
                "0xtx2",
            ))
            .await
            .unwrap();

        assert_eq!(strategy, Some(MatchStrategy::UniqueTolerance));
    }

    #[tokio::test]
    async fn test_requested_exact_outranks_tolerance() {
        let repo = setup().await;
        let far_future = chrono::Utc::now().timestamp() + 7_200;
        // Transfer equals the expected amount exactly, and is also within
        // 1 wei of the unique amount; exactness on the nominal wins.
        repo.insert_payment_request(&request(
            "r1",
            ten_with_wei(346),
            ten_with_wei(347),
            None,
            far_future,
        ))
        .await
        .unwrap();

        let m = matcher(repo.clone());
        let strategy = m
            .handle_transfer(&observed(
                Address::repeat_byte(0xaa),
                ten_with_wei(346),
                "0xtx3",
            ))
            .await
            .unwrap();

        assert_eq!(strategy, Some(MatchStrategy::RequestedExact));
    }

    #[tokio::test]
    async fn test_wallet_amount_requires_bound_sender() {
        let repo = setup().await;
        let far_future = chrono::Utc::now().timestamp() + 7_200;
        let sender = Address::repeat_byte(0xaa);
        repo.insert_payment_request(&request(
            "r1",
            ten_with_wei(0),
            ten_with_wei(347),
            Some(&format!("{sender:?}").to_lowercase()),
            far_future,
        ))
        .await
        .unwrap();

        let m = matcher(repo.clone());
        // 0.05 display units above the expected amount, below the 0.1
        // tolerance, but nowhere near the unique amount.
        let off_by = U256::from(5u64) * U256::from(10u64).pow(U256::from(16u64));
        let strategy = m
            .handle_transfer(&observed(sender, ten_with_wei(0) + off_by, "0xtx4"))
            .await
            .unwrap();
        assert_eq!(strategy, Some(MatchStrategy::WalletAmount));

        // The same amount from an unknown sender matches nothing.
        let repo2 = setup().await;
        repo2
            .insert_payment_request(&request(
                "r2",
                ten_with_wei(0),
                ten_with_wei(347),
                Some(&format!("{sender:?}").to_lowercase()),
                far_future,
            ))
            .await
            .unwrap();
        let m2 = matcher(repo2);
        let strategy = m2
            .handle_transfer(&observed(
                Address::repeat_byte(0xbb),
                ten_with_wei(0) + off_by,
                "0xtx5",
            ))
            .await
            .unwrap();
        assert_eq!(strategy, None);
    }

    #[tokio::test]
    async fn test_expired_request_is_not_credited() {
        let repo = setup().await;
        let past = chrono::Utc::now().timestamp() - 1;
        repo.insert_payment_request(&request(
            "r1",
            ten_with_wei(0),
            ten_with_wei(347),
            None,
            past,
        ))
        .await
        .unwrap();

        // The sweep runs before the transfer arrives.
        repo.expire_due_requests(chrono::Utc::now().timestamp())
            .await
            .unwrap();

        let m = matcher(repo.clone());
        let strategy = m
            .handle_transfer(&observed(
                Address::repeat_byte(0xaa),
                ten_with_wei(347),
                "0xtx6",
            ))
            .await
            .unwrap();

        assert_eq!(strategy, None);
        let row = repo.get_payment_request("r1").await.unwrap().unwrap();
        assert_eq!(row.status, "EXPIRED");
        assert!(!repo.matched_transfer_exists("0xtx6").await.unwrap());
    }

    #[tokio::test]
    async fn test_already_matched_tx_is_skipped() {
        let repo = setup().await;
        let far_future = chrono::Utc::now().timestamp() + 7_200;
        repo.insert_payment_request(&request(
            "r1",
            ten_with_wei(0),
            ten_with_wei(347),
            None,
            far_future,
        ))
        .await
        .unwrap();
        repo.insert_payment_request(&request(
            "r2",
            ten_with_wei(0),
            ten_with_wei(521),
            None,
            far_future,
        ))
        .await
        .unwrap();

        let m = matcher(repo.clone());
        let transfer = observed(Address::repeat_byte(0xaa), ten_with_wei(347), "0xtx7");
        assert!(m.handle_transfer(&transfer).await.unwrap().is_some());

        // Replaying the same transaction hash matches nothing further.
        assert_eq!(m.handle_transfer(&transfer).await.unwrap(), None);
        let r2 = repo.get_payment_request("r2").await.unwrap().unwrap();
        assert_eq!(r2.status, "PENDING");
    }

    #[tokio::test]
    async fn test_create_request_perturbs_uniquely() {
        let repo = setup().await;
        let expected = ten_with_wei(0);

        let first = create_request(
            &repo,
            "player-1",
            PaymentKind::Deposit,
            expected,
            None,
            Duration::from_secs(3_600),
        )
        .await
        .unwrap();
        let second = create_request(
            &repo,
            "player-2",
            PaymentKind::Deposit,
            expected,
            None,
            Duration::from_secs(3_600),
        )
        .await
        .unwrap();

        assert_ne!(first.unique_amount, second.unique_amount);
        assert!(first.unique_amount > expected);
        assert!(first.unique_amount - expected < U256::from(1_000u64));
    }

    #[tokio::test]
    async fn test_matcher_ignores_foreign_token() {
        let repo = setup().await;
        let custodial = Address::repeat_byte(0xcc);
        let payment_token = Address::repeat_byte(0x01);
        let m = PaymentMatcher::new(repo, custodial, Some(payment_token));

        let event = StoredEvent {
            chain_id: 53935,
            tx_hash: "0xtx".to_string(),
            log_index: 0,
            block_number: 1,
            block_timestamp: 0,
            event: DecodedEvent::Erc20Transfer {
                token: Address::repeat_byte(0x02),
                from: Address::repeat_byte(0xaa),
                to: custodial,
                amount: ten_with_wei(0),
            },
        };
        assert!(m.observed_from_event(&event).is_none());
    }
}
