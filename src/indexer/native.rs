//! Native-coin payment scanner.
//!
//! ERC-20 payments reach the matcher through the Transfer log stream, but
//! native-coin payments leave no logs. This scanner walks blocks with their
//! full transaction lists, picks out value transfers to the custodial
//! wallet, and emits synthetic [`StoredEvent`]s shaped like transfers so
//! the payment matcher consumes one stream type.
//!
//! Synthetic rows are persisted to the event table with `log_index = -1`
//! (native transfers have no log position) under a `native` checkpoint
//! scope, with the same transactional durability as the log indexers.

use std::sync::Arc;

use alloy::consensus::Transaction as _;
use alloy::network::TransactionResponse as _;
use alloy::primitives::Address;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::db::models::RawEventRow;
use crate::db::repository::Repository;
use crate::error::{LedgerError, LedgerResult};
use crate::events::DecodedEvent;

use super::checkpoint::CheckpointStore;
use super::{IndexerStatus, StoredEvent, BROADCAST_CAPACITY};

/// Blocks fetched per iteration; block-with-txs calls are heavy, so this
/// stays well below the log indexers' batch size.
const NATIVE_BATCH_BLOCKS: u64 = 50;

/// Scans blocks for native value transfers to the custodial wallet.
pub struct NativeScanner {
    client: Arc<ChainClient>,
    repo: Arc<Repository>,
    custodial_wallet: Address,
    start_block: u64,
    checkpoint: CheckpointStore,
    events_tx: broadcast::Sender<StoredEvent>,
    status: Arc<IndexerStatus>,
}

impl NativeScanner {
    /// Create a scanner for one chain's custodial wallet.
    #[must_use]
    pub fn new(
        client: Arc<ChainClient>,
        repo: Arc<Repository>,
        custodial_wallet: Address,
        start_block: u64,
        enabled: bool,
    ) -> Self {
        let chain_id = client.chain_id();
        let name = format!("{}/native_payments", client.descriptor().name);
        let checkpoint = CheckpointStore::new(repo.clone(), chain_id, "native", "");
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Self {
            client,
            repo,
            custodial_wallet,
            start_block,
            checkpoint,
            events_tx,
            status: Arc::new(IndexerStatus::new(&name, chain_id, "", enabled)),
        }
    }

    /// The shared status cell.
    #[must_use]
    pub fn status(&self) -> Arc<IndexerStatus> {
        self.status.clone()
    }

    /// Subscribe to synthetic transfer events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.events_tx.subscribe()
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.status.set_running(true);
        info!(
            chain_id = self.client.chain_id(),
            wallet = %self.custodial_wallet,
            "Native payment scanner starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.step().await {
                Ok(progressed) => {
                    self.status.clear_error();
                    if !progressed {
                        tokio::select! {
                            () = tokio::time::sleep(self.client.descriptor().idle_delay()) => {}
                            () = shutdown.cancelled() => break,
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Native scan iteration failed, will retry");
                    self.status.set_error(&e);
                    tokio::select! {
                        () = tokio::time::sleep(self.client.descriptor().idle_delay()) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.status.set_running(false);
        info!(chain_id = self.client.chain_id(), "Native payment scanner stopped");
    }

    /// One iteration; returns whether any blocks were processed.
    async fn step(&self) -> LedgerResult<bool> {
        let last_done = match self.checkpoint.read().await? {
            Some(block) => block,
            None => self.start_block.saturating_sub(1),
        };

        let head = self.client.confirmed_head().await?;
        self.status.set_head(head);

        if head <= last_done {
            self.status.set_last_processed(last_done);
            return Ok(false);
        }

        let from = last_done + 1;
        let to = head.min(last_done.saturating_add(NATIVE_BATCH_BLOCKS));

        let mut found = Vec::new();
        for number in from..=to {
            let Some(block) = self.client.get_block_with_txs(number).await? else {
                // The confirmed head should always resolve; treat a miss as
                // transient and retry the range next iteration.
                return Err(LedgerError::rpc_transient(
                    format!("block {number} not found below confirmed head"),
                    None,
                ));
            };

            let timestamp = i64::try_from(block.header.timestamp).unwrap_or(0);
            let Some(txs) = block.transactions.as_transactions() else {
                continue;
            };

            for tx in txs {
                if alloy::consensus::Transaction::to(tx) != Some(self.custodial_wallet)
                    || tx.value().is_zero()
                {
                    continue;
                }
                // Unlike logs, block transaction lists include reverted
                // transactions; only successful sends count as payments.
                match self.client.get_receipt(tx.tx_hash()).await? {
                    Some(receipt) if receipt.status() => {}
                    _ => {
                        warn!(tx_hash = %tx.tx_hash(), "Skipping unsuccessful native transfer");
                        continue;
                    }
                }
                found.push(StoredEvent {
                    chain_id: self.client.chain_id(),
                    tx_hash: format!("{:?}", tx.tx_hash()),
                    log_index: 0,
                    block_number: number,
                    block_timestamp: timestamp,
                    event: DecodedEvent::NativeTransfer {
                        from: tx.from,
                        to: self.custodial_wallet,
                        amount: tx.value(),
                    },
                });
            }
        }

        self.ingest(to, found).await?;
        self.status.set_last_processed(to);
        Ok(true)
    }

    async fn ingest(&self, to: u64, found: Vec<StoredEvent>) -> LedgerResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.repo.begin().await?;
        let mut fresh = Vec::new();

        for event in found {
            let payload = serde_json::to_string(&event.event).map_err(|e| {
                LedgerError::decoding("failed to serialize native transfer", Some(Box::new(e)))
            })?;

            let row = RawEventRow {
                chain_id: i64::try_from(event.chain_id).unwrap_or(i64::MAX),
                tx_hash: event.tx_hash.clone(),
                // Native transfers carry no log position.
                log_index: -1,
                block_number: i64::try_from(event.block_number).unwrap_or(0),
                block_timestamp: event.block_timestamp,
                contract_address: "native".to_string(),
                topic0: String::new(),
                stream: "transfers".to_string(),
                payload,
                ingested_at: now,
            };

            if self.repo.insert_event(&mut tx, &row).await? {
                fresh.push(event);
            }
        }

        self.checkpoint.advance(&mut tx, to, now).await?;
        tx.commit().await.map_err(|e| {
            LedgerError::database("Failed to commit native scan batch".to_string(), Some(Box::new(e)))
        })?;

        for event in fresh {
            let _ = self.events_tx.send(event);
        }

        Ok(())
    }
}
