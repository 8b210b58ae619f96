//! End-to-end payment matching scenarios.
//!
//! Drives the full path a real payment takes: request creation with a
//! perturbed unique amount, an observed transfer, the strategy cascade,
//! the transactional state transition, the outbound notification, and the
//! downstream consumption handoff.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};

use realm_ledger::db::create_pool;
use realm_ledger::db::models::{MatchStrategy, PaymentKind, PaymentStatus};
use realm_ledger::db::repository::Repository;
use realm_ledger::payments::{create_request, ObservedTransfer, PaymentMatcher};

fn custodial() -> Address {
    Address::repeat_byte(0xcc)
}

fn sender() -> Address {
    Address::repeat_byte(0xaa)
}

fn ten_tokens() -> U256 {
    U256::from(10u64) * U256::from(10u64).pow(U256::from(18u64))
}

async fn setup() -> Arc<Repository> {
    let pool = create_pool("sqlite::memory:").await.expect("pool");
    Arc::new(Repository::new(pool))
}

fn transfer(amount: U256, tx: &str) -> ObservedTransfer {
    ObservedTransfer {
        from: sender(),
        amount,
        tx_hash: tx.to_string(),
        block_number: 1_000,
    }
}

#[tokio::test]
async fn created_request_matches_on_its_unique_amount() {
    let repo = setup().await;
    let matcher = PaymentMatcher::new(repo.clone(), custodial(), None);
    let mut notifications = matcher.subscribe();

    let created = create_request(
        &repo,
        "player-1",
        PaymentKind::Deposit,
        ten_tokens(),
        Some(sender()),
        Duration::from_secs(7_200),
    )
    .await
    .expect("create request");

    // The player sends exactly the instructed amount.
    let strategy = matcher
        .handle_transfer(&transfer(created.unique_amount, "0xdeposit1"))
        .await
        .expect("match attempt");
    assert_eq!(strategy, Some(MatchStrategy::UniqueExact));

    // Request transitioned, match row recorded, notification emitted.
    let row = repo
        .get_payment_request(&created.id)
        .await
        .unwrap()
        .expect("request row");
    assert_eq!(row.status, "MATCHED");
    assert_eq!(row.matched_tx_hash.as_deref(), Some("0xdeposit1"));

    let matched = notifications.try_recv().expect("notification");
    assert_eq!(matched.request_id, created.id);
    assert_eq!(matched.strategy, MatchStrategy::UniqueExact);

    // Downstream consumes the match; the transition is forward-only.
    assert!(repo
        .transition_request(&created.id, PaymentStatus::Matched, PaymentStatus::Consumed)
        .await
        .unwrap());
    assert!(!repo
        .transition_request(&created.id, PaymentStatus::Pending, PaymentStatus::Matched)
        .await
        .unwrap());
}

#[tokio::test]
async fn rpc_rounding_is_absorbed_by_the_tolerance_strategy() {
    let repo = setup().await;
    let matcher = PaymentMatcher::new(repo.clone(), custodial(), None);

    let created = create_request(
        &repo,
        "player-1",
        PaymentKind::Deposit,
        ten_tokens(),
        None,
        Duration::from_secs(7_200),
    )
    .await
    .expect("create request");

    // One wei off the instructed amount.
    let strategy = matcher
        .handle_transfer(&transfer(created.unique_amount - U256::from(1u64), "0xdeposit2"))
        .await
        .expect("match attempt");
    assert_eq!(strategy, Some(MatchStrategy::UniqueTolerance));
}

#[tokio::test]
async fn concurrent_requests_with_the_same_nominal_stay_separable() {
    let repo = setup().await;
    let matcher = PaymentMatcher::new(repo.clone(), custodial(), None);

    // Two players request the same nominal amount in the same window.
    let first = create_request(
        &repo,
        "player-1",
        PaymentKind::Deposit,
        ten_tokens(),
        None,
        Duration::from_secs(7_200),
    )
    .await
    .expect("first request");
    let second = create_request(
        &repo,
        "player-2",
        PaymentKind::Deposit,
        ten_tokens(),
        None,
        Duration::from_secs(7_200),
    )
    .await
    .expect("second request");

    assert_ne!(first.unique_amount, second.unique_amount);

    // Player 2 pays; only player 2's request matches.
    matcher
        .handle_transfer(&transfer(second.unique_amount, "0xdeposit3"))
        .await
        .expect("match attempt");

    let row1 = repo.get_payment_request(&first.id).await.unwrap().unwrap();
    let row2 = repo.get_payment_request(&second.id).await.unwrap().unwrap();
    assert_eq!(row1.status, "PENDING");
    assert_eq!(row2.status, "MATCHED");
}

#[tokio::test]
async fn expired_requests_are_never_credited() {
    let repo = setup().await;
    let matcher = PaymentMatcher::new(repo.clone(), custodial(), None);

    let created = create_request(
        &repo,
        "player-1",
        PaymentKind::Deposit,
        ten_tokens(),
        None,
        Duration::from_secs(0),
    )
    .await
    .expect("create request");

    // The sweep fires before the (late) transfer arrives.
    repo.expire_due_requests(chrono::Utc::now().timestamp() + 1)
        .await
        .unwrap();

    let strategy = matcher
        .handle_transfer(&transfer(created.unique_amount, "0xlate"))
        .await
        .expect("match attempt");
    assert_eq!(strategy, None);

    let row = repo.get_payment_request(&created.id).await.unwrap().unwrap();
    assert_eq!(row.status, "EXPIRED");
    assert!(!repo.matched_transfer_exists("0xlate").await.unwrap());
}
