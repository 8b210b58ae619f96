//! Durable per-indexer cursor, bound to one `(chain, contract, shard)`.
//!
//! The store is a thin typed handle over the checkpoint table. Reads go
//! through the pool; advances happen inside the caller's ingestion
//! transaction so that event rows and the cursor commit atomically: a crash
//! can never leave events without a checkpoint advance, nor an advance
//! without its events.

use std::sync::Arc;

use sqlx::SqliteConnection;

use crate::db::repository::Repository;
use crate::error::LedgerResult;

/// Handle on one indexer's durable cursor.
#[derive(Clone)]
pub struct CheckpointStore {
    repo: Arc<Repository>,
    chain_id: u64,
    contract: String,
    shard_key: String,
}

impl CheckpointStore {
    /// Bind a store to one `(chain, contract, shard)` triple.
    #[must_use]
    pub fn new(repo: Arc<Repository>, chain_id: u64, contract: &str, shard_key: &str) -> Self {
        Self {
            repo,
            chain_id,
            contract: contract.to_string(),
            shard_key: shard_key.to_string(),
        }
    }

    /// The shard key this store is bound to.
    #[must_use]
    pub fn shard_key(&self) -> &str {
        &self.shard_key
    }

    /// Read the highest fully-ingested block, `None` on first run.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn read(&self) -> LedgerResult<Option<u64>> {
        self.repo
            .get_checkpoint(self.chain_id, &self.contract, &self.shard_key)
            .await
    }

    /// Advance the cursor inside the caller's transaction.
    ///
    /// Equal-value advances are idempotent; regressions fail with
    /// [`LedgerError::NonMonotonicCheckpoint`](crate::error::LedgerError)
    /// and must stop the owning indexer.
    ///
    /// # Errors
    ///
    /// Non-monotonic advance or database failure.
    pub async fn advance(
        &self,
        conn: &mut SqliteConnection,
        new_block: u64,
        now: i64,
    ) -> LedgerResult<()> {
        self.repo
            .advance_checkpoint(
                conn,
                self.chain_id,
                &self.contract,
                &self.shard_key,
                new_block,
                now,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::error::LedgerError;

    async fn setup() -> Arc<Repository> {
        let pool = create_pool("sqlite::memory:").await.expect("pool");
        Arc::new(Repository::new(pool))
    }

    #[tokio::test]
    async fn test_read_advance_cycle() {
        let repo = setup().await;
        let store = CheckpointStore::new(repo.clone(), 53935, "0xabc", "");

        assert_eq!(store.read().await.unwrap(), None);

        let mut tx = repo.begin().await.unwrap();
        store.advance(&mut tx, 1_000, 0).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.read().await.unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn test_shards_are_independent() {
        let repo = setup().await;
        let shard_a = CheckpointStore::new(repo.clone(), 1, "0xabc", "3");
        let shard_b = CheckpointStore::new(repo.clone(), 1, "0xabc", "4");

        let mut tx = repo.begin().await.unwrap();
        shard_a.advance(&mut tx, 50, 0).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(shard_a.read().await.unwrap(), Some(50));
        assert_eq!(shard_b.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_regression_is_rejected() {
        let repo = setup().await;
        let store = CheckpointStore::new(repo.clone(), 1, "0xabc", "");

        let mut tx = repo.begin().await.unwrap();
        store.advance(&mut tx, 100, 0).await.unwrap();
        let err = store.advance(&mut tx, 99, 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::NonMonotonicCheckpoint { .. }));
    }
}
