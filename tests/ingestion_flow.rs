//! End-to-end ingestion tests against an in-memory database.
//!
//! The indexer's transactional core (`ingest`) is exercised directly with
//! synthetic scanned events, covering the exactly-once key, checkpoint
//! coupling, idempotent re-scans and the broadcast channel. No RPC
//! endpoint is needed: the chain client is constructed but never called.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use realm_ledger::chain::{ChainClient, ChainDescriptor};
use realm_ledger::db::create_pool;
use realm_ledger::db::repository::Repository;
use realm_ledger::events::{DecodedEvent, DecoderRegistry, GardenVersion};
use realm_ledger::indexer::sink::{EventContext, LedgerSink};
use realm_ledger::indexer::{Indexer, IndexerConfig, ScannedEvent};

const CHAIN_ID: u64 = 53935;

fn contract() -> Address {
    Address::repeat_byte(0x42)
}

fn offline_client() -> Arc<ChainClient> {
    let descriptor = ChainDescriptor {
        chain_id: CHAIN_ID,
        name: "dfkchain".to_string(),
        rpc_urls: vec!["http://localhost:8545".to_string()],
        native_decimals: 18,
        avg_block_time_secs: 2,
        confirmation_depth: 10,
    };
    Arc::new(ChainClient::new(descriptor).expect("client"))
}

async fn build_indexer() -> (Arc<Indexer>, Arc<Repository>) {
    let pool = create_pool("sqlite::memory:").await.expect("pool");
    let repo = Arc::new(Repository::new(pool));

    let indexer = Arc::new(Indexer::new(
        IndexerConfig {
            name: "dfkchain/pool_staking_v2".to_string(),
            chain_id: CHAIN_ID,
            contract: contract(),
            decoder_key: "pool_staking_v2".to_string(),
            shard_key: String::new(),
            start_block: 1,
            batch_blocks: 1_000,
            max_batch_blocks: 4_000,
        },
        offline_client(),
        Arc::new(DecoderRegistry::new()),
        repo.clone(),
        Arc::new(LedgerSink::new(repo.clone())),
        true,
    ));

    (indexer, repo)
}

fn deposit_event(block: u64, log_index: u64, wallet: Address, amount: u64) -> ScannedEvent {
    ScannedEvent {
        ctx: EventContext {
            chain_id: CHAIN_ID,
            tx_hash: format!("0xtx{block:04}{log_index:02}"),
            log_index,
            block_number: block,
            block_timestamp: 1_700_000_000 + i64::try_from(block).unwrap_or(0),
        },
        topic0: "0xdeposit".to_string(),
        event: DecodedEvent::PoolDeposit {
            version: GardenVersion::V2,
            pool_id: 3,
            wallet,
            amount: U256::from(amount),
        },
    }
}

#[tokio::test]
async fn ingest_commits_rows_checkpoint_and_stakes_together() {
    let (indexer, repo) = build_indexer().await;
    let wallet = Address::repeat_byte(0xaa);
    let contract_key = format!("{:?}", contract()).to_lowercase();

    let batch = vec![
        deposit_event(100, 0, wallet, 500),
        deposit_event(101, 0, wallet, 250),
    ];

    let inserted = indexer.ingest(150, batch).await.expect("ingest");
    assert_eq!(inserted, 2);

    // Rows, checkpoint and derived stake all landed in one transaction.
    assert_eq!(repo.count_events(CHAIN_ID, &contract_key).await.unwrap(), 2);
    assert_eq!(
        repo.get_checkpoint(CHAIN_ID, &contract_key, "").await.unwrap(),
        Some(150)
    );
    let stake = repo
        .get_stake(CHAIN_ID, 3, &format!("{wallet:?}").to_lowercase())
        .await
        .unwrap()
        .expect("stake row");
    assert_eq!(stake.lp_amount_wei().unwrap(), U256::from(750u64));
}

#[tokio::test]
async fn rescanning_a_processed_range_is_idempotent() {
    let (indexer, repo) = build_indexer().await;
    let wallet = Address::repeat_byte(0xbb);
    let contract_key = format!("{:?}", contract()).to_lowercase();

    let batch = vec![deposit_event(200, 0, wallet, 100)];
    assert_eq!(indexer.ingest(200, batch.clone()).await.unwrap(), 1);

    // The replayed range produces zero new rows, no checkpoint regression
    // and no double-applied stake.
    assert_eq!(indexer.ingest(200, batch).await.unwrap(), 0);
    assert_eq!(repo.count_events(CHAIN_ID, &contract_key).await.unwrap(), 1);
    assert_eq!(
        repo.get_checkpoint(CHAIN_ID, &contract_key, "").await.unwrap(),
        Some(200)
    );
    let stake = repo
        .get_stake(CHAIN_ID, 3, &format!("{wallet:?}").to_lowercase())
        .await
        .unwrap()
        .expect("stake row");
    assert_eq!(stake.lp_amount_wei().unwrap(), U256::from(100u64));
}

#[tokio::test]
async fn checkpoint_never_regresses() {
    let (indexer, _repo) = build_indexer().await;
    let wallet = Address::repeat_byte(0xcc);

    indexer
        .ingest(300, vec![deposit_event(300, 0, wallet, 1)])
        .await
        .unwrap();

    // Driving the cursor backwards is a bug-class failure, not a no-op.
    let err = indexer
        .ingest(250, vec![deposit_event(250, 0, wallet, 1)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        realm_ledger::error::LedgerError::NonMonotonicCheckpoint { .. }
    ));
}

#[tokio::test]
async fn broadcast_delivers_each_new_row_once() {
    let (indexer, _repo) = build_indexer().await;
    let wallet = Address::repeat_byte(0xdd);
    let mut rx = indexer.subscribe();

    let batch = vec![
        deposit_event(400, 0, wallet, 10),
        deposit_event(400, 1, wallet, 20),
    ];
    indexer.ingest(400, batch.clone()).await.unwrap();
    // Replay inserts nothing, so nothing further is broadcast.
    indexer.ingest(400, batch).await.unwrap();

    let first = rx.try_recv().expect("first event");
    let second = rx.try_recv().expect("second event");
    assert_ne!(
        (first.tx_hash.clone(), first.log_index),
        (second.tx_hash.clone(), second.log_index)
    );
    assert!(rx.try_recv().is_err(), "no third delivery");
}

#[tokio::test]
async fn decode_failures_never_block_a_range() {
    use alloy::primitives::LogData;
    use alloy::rpc::types::Log;

    // A log with a truncated payload decodes to an error, not a panic,
    // and the registry reports it as such.
    let registry = DecoderRegistry::new();
    let log = Log {
        inner: alloy::primitives::Log {
            address: contract(),
            data: LogData::new_unchecked(vec![], vec![0x01].into()),
        },
        ..Default::default()
    };
    assert!(registry.decode("pool_staking_v2", &log).is_err());
}
