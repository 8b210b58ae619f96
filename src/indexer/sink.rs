//! Event sinks: derived-state updates applied inside the ingestion
//! transaction.
//!
//! The indexer framework inserts the raw event row, then hands each *newly
//! inserted* event to its sink. Because replays are deduplicated by the
//! primary key, a sink only ever sees an event once per database, which
//! keeps derived state (stakes, bridge rows) replay-safe.

use std::sync::Arc;

use alloy::primitives::Address;
use sqlx::SqliteConnection;

use crate::db::models::{u256_to_db, BridgeEventRow, PricingSource};
use crate::db::repository::Repository;
use crate::error::LedgerResult;
use crate::events::DecodedEvent;

/// Position of an event within the chain, passed alongside the payload.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Chain id
    pub chain_id: u64,
    /// Transaction hash (hex string)
    pub tx_hash: String,
    /// Log index within the block
    pub log_index: u64,
    /// Block number
    pub block_number: u64,
    /// Block timestamp (unix seconds, 0 when unavailable)
    pub block_timestamp: i64,
}

/// Derived-state hook run inside the ingestion transaction.
#[axum::async_trait]
pub trait EventSink: Send + Sync {
    /// Apply one newly inserted event to derived state.
    ///
    /// # Errors
    ///
    /// Database failures abort the enclosing transaction.
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &EventContext,
        event: &DecodedEvent,
    ) -> LedgerResult<()>;
}

/// Sink that maintains the stake table and the bridge read model.
///
/// - Pool deposits/withdrawals mutate `stakes`; V1 and V2 events for the
///   same pool land on the same row, which is what lets the valuation
///   engine sum the two generations.
/// - Bridge transfers are normalized into `bridge_events`, valued from the
///   most recent persisted price observation. Pricing here never reaches
///   out over HTTP; the scheduler's refresher keeps the observations warm,
///   and a token with no observation is recorded as `UNVALUED` with a zero
///   USD value.
pub struct LedgerSink {
    repo: Arc<Repository>,
}

impl LedgerSink {
    /// Create a sink over the shared repository.
    #[must_use]
    pub const fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    async fn bridge_usd(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        token: Address,
        amount: alloy::primitives::U256,
        at: i64,
    ) -> LedgerResult<(f64, PricingSource)> {
        let token_key = format!("{token:?}").to_lowercase();
        let at = if at > 0 { Some(at) } else { None };

        match self
            .repo
            .token_price_at_tx(conn, chain_id, &token_key, at)
            .await?
        {
            Some(price) => {
                let source = PricingSource::parse(&price.source)?;
                // 18-decimal wei to display units; precision loss here is
                // bounded by f64 and acceptable for analytics columns.
                let display = crate::pricing::display_units(amount, 18);
                Ok((crate::db::models::round_usd(display * price.price_usd), source))
            }
            None => Ok((0.0, PricingSource::Unvalued)),
        }
    }
}

#[axum::async_trait]
impl EventSink for LedgerSink {
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &EventContext,
        event: &DecodedEvent,
    ) -> LedgerResult<()> {
        match event {
            DecodedEvent::PoolDeposit {
                version,
                pool_id,
                wallet,
                amount,
            } => {
                self.repo
                    .apply_stake_delta(
                        conn,
                        ctx.chain_id,
                        *pool_id,
                        &format!("{wallet:?}").to_lowercase(),
                        *version,
                        *amount,
                        false,
                        ctx.block_timestamp,
                    )
                    .await
            }
            DecodedEvent::PoolWithdraw {
                version,
                pool_id,
                wallet,
                amount,
            } => {
                self.repo
                    .apply_stake_delta(
                        conn,
                        ctx.chain_id,
                        *pool_id,
                        &format!("{wallet:?}").to_lowercase(),
                        *version,
                        *amount,
                        true,
                        ctx.block_timestamp,
                    )
                    .await
            }
            DecodedEvent::BridgeTransfer {
                direction,
                wallet,
                token,
                amount,
                counterparty_chain_id,
            } => {
                let (usd, source) = self
                    .bridge_usd(conn, ctx.chain_id, *token, *amount, ctx.block_timestamp)
                    .await?;

                let row = BridgeEventRow {
                    chain_id: i64::try_from(ctx.chain_id).unwrap_or(i64::MAX),
                    tx_hash: ctx.tx_hash.clone(),
                    log_index: i64::try_from(ctx.log_index).unwrap_or(0),
                    direction: direction.as_str().to_string(),
                    wallet: format!("{wallet:?}").to_lowercase(),
                    token: format!("{token:?}").to_lowercase(),
                    amount_wei: u256_to_db(*amount),
                    counterparty_chain_id: i64::try_from(*counterparty_chain_id).unwrap_or(0),
                    usd_value_at_event: usd,
                    pricing_source: source.as_str().to_string(),
                    block_number: i64::try_from(ctx.block_number).unwrap_or(0),
                    block_timestamp: ctx.block_timestamp,
                };
                self.repo.insert_bridge_event(conn, &row).await
            }
            // Rewards, quests, combat, jeweler and plain transfers carry no
            // derived state beyond the event row itself.
            _ => Ok(()),
        }
    }
}

/// Sink with no derived state, for tests and pure-audit streams.
pub struct NullSink;

#[axum::async_trait]
impl EventSink for NullSink {
    async fn apply(
        &self,
        _conn: &mut SqliteConnection,
        _ctx: &EventContext,
        _event: &DecodedEvent,
    ) -> LedgerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::db::models::TokenPriceRow;
    use crate::events::{BridgeDirection, GardenVersion};
    use alloy::primitives::U256;

    async fn setup() -> Arc<Repository> {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        Arc::new(Repository::new(pool))
    }

    fn ctx(block: u64) -> EventContext {
        EventContext {
            chain_id: 53935,
            tx_hash: format!("0xtx{block}"),
            log_index: 0,
            block_number: block,
            block_timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_v1_and_v2_deposits_sum_on_one_stake_row() {
        let repo = setup().await;
        let sink = LedgerSink::new(repo.clone());
        let wallet = Address::repeat_byte(0x11);

        let mut tx = repo.begin().await.unwrap();
        sink.apply(
            &mut tx,
            &ctx(1),
            &DecodedEvent::PoolDeposit {
                version: GardenVersion::V1,
                pool_id: 2,
                wallet,
                amount: U256::from(100u64),
            },
        )
        .await
        .unwrap();
        sink.apply(
            &mut tx,
            &ctx(2),
            &DecodedEvent::PoolDeposit {
                version: GardenVersion::V2,
                pool_id: 2,
                wallet,
                amount: U256::from(40u64),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let key = format!("{wallet:?}").to_lowercase();
        let stake = repo.get_stake(53935, 2, &key).await.unwrap().unwrap();
        assert_eq!(stake.lp_amount_wei().unwrap(), U256::from(140u64));
    }

    #[tokio::test]
    async fn test_bridge_event_unvalued_without_price() {
        let repo = setup().await;
        let sink = LedgerSink::new(repo.clone());

        let mut tx = repo.begin().await.unwrap();
        sink.apply(
            &mut tx,
            &ctx(5),
            &DecodedEvent::BridgeTransfer {
                direction: BridgeDirection::Out,
                wallet: Address::repeat_byte(0x22),
                token: Address::repeat_byte(0x33),
                amount: U256::from(10u64).pow(U256::from(18u64)),
                counterparty_chain_id: 8217,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let events = repo.recent_bridge_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pricing_source, "UNVALUED");
        assert!((events[0].usd_value_at_event - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bridge_event_valued_from_persisted_price() {
        let repo = setup().await;
        let sink = LedgerSink::new(repo.clone());
        let token = Address::repeat_byte(0x33);

        repo.insert_token_price(&TokenPriceRow {
            chain_id: 53935,
            token: format!("{token:?}").to_lowercase(),
            as_of: 1_699_999_999,
            price_usd: 2.5,
            source: "DEFILLAMA".to_string(),
            confidence: 1.0,
        })
        .await
        .unwrap();

        let mut tx = repo.begin().await.unwrap();
        sink.apply(
            &mut tx,
            &ctx(6),
            &DecodedEvent::BridgeTransfer {
                direction: BridgeDirection::In,
                wallet: Address::repeat_byte(0x22),
                token,
                amount: U256::from(2u64) * U256::from(10u64).pow(U256::from(18u64)),
                counterparty_chain_id: 1,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let events = repo.recent_bridge_events(10).await.unwrap();
        assert_eq!(events[0].pricing_source, "DEFILLAMA");
        assert!((events[0].usd_value_at_event - 5.0).abs() < 1e-9);
    }
}
