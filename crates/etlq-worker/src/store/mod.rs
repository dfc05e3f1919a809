//! Storage seams consumed by the queue and the transfer engine
//!
//! The engine never talks to a database directly. It is handed a [`Stores`]
//! bundle whose members are implemented by the Postgres adapters in
//! [`crate::db`]. Unit tests swap in an in-memory store.

#[cfg(test)]
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;

use crate::db::{PgLock, PgQueueStore, PgTableStore};
use crate::error::StoreResult;
use crate::queue::{BatchRange, QueueItem, QueueProgress, QueueStatus, TransferPair};
use crate::transfer::Row;

/// Durable queue table operations
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert one WAITING item with `attempts = 0`
    async fn enqueue(
        &self,
        pair: &TransferPair,
        batch_size: u32,
        range: BatchRange,
    ) -> StoreResult<QueueItem>;

    /// Atomically move the oldest WAITING item of the pair and cluster to RUNNING
    ///
    /// Returns `None` when nothing is waiting. Two concurrent callers never
    /// receive the same item.
    async fn claim_next(&self, pair: &TransferPair, cluster_id: u32)
        -> StoreResult<Option<QueueItem>>;

    /// Apply a status transition
    ///
    /// Re-applying the current status is a no-op. Any other move not allowed
    /// by [`QueueStatus::can_transition_to`] is rejected.
    async fn set_status(
        &self,
        id: i64,
        status: QueueStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    /// Highest `last_id` ever enqueued for the pair
    async fn high_watermark(&self, pair: &TransferPair) -> StoreResult<Option<i64>>;

    async fn progress(&self, pair: &TransferPair) -> StoreResult<QueueProgress>;

    /// Send every FAILED item of the pair back to WAITING; returns the count moved
    async fn requeue_failed(&self, pair: &TransferPair) -> StoreResult<u64>;

    /// Send every RUNNING item of the pair back to WAITING; returns the count moved
    ///
    /// Recovers batches left behind by a crashed worker. Only safe while no
    /// worker is processing the pair.
    async fn requeue_running(&self, pair: &TransferPair) -> StoreResult<u64>;

    /// Delete every queue row of the pair; returns the count deleted
    async fn clear(&self, pair: &TransferPair) -> StoreResult<u64>;

    async fn get(&self, id: i64) -> StoreResult<Option<QueueItem>>;
}

/// Read access to source tables
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// All ids of `table` in ascending order
    async fn source_ids(&self, table: &str) -> StoreResult<Vec<i64>>;

    /// Rows with `start_id <= id <= last_id`, ascending, at most `limit` of them
    async fn fetch_range(
        &self,
        table: &str,
        start_id: i64,
        last_id: i64,
        limit: u32,
    ) -> StoreResult<Vec<Row>>;
}

/// Rows written by one batch load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub inserted: u64,
    pub updated: u64,
}

impl LoadReport {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Write access to destination tables
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// Upsert `rows` into `table` in one all-or-nothing transaction
    ///
    /// Each row is inserted with its own `id`; on a primary-key collision the
    /// existing row's other `columns` are updated instead. Columns missing
    /// from a row are written as NULL.
    async fn load_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> StoreResult<LoadReport>;

    /// Delete every row of `table`; returns the count deleted
    async fn clear_table(&self, table: &str) -> StoreResult<u64>;
}

/// Keyed lease with an expiry, shared by every process of the fleet
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take `key` for `ttl` unless another holder has an unexpired lease
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Drop a lease held by this process; releasing a lease not held is a no-op
    async fn release(&self, key: &str) -> StoreResult<()>;
}

/// The store handles one process shares across its transfer engines
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn QueueStore>,
    pub source: Arc<dyn SourceReader>,
    pub destination: Arc<dyn DestinationWriter>,
    pub lock: Arc<dyn DistributedLock>,
}

impl Stores {
    /// Postgres-backed stores sharing one pool
    pub fn postgres(pool: PgPool) -> Self {
        let tables = Arc::new(PgTableStore::new(pool.clone()));
        Self {
            queue: Arc::new(PgQueueStore::new(pool.clone())),
            source: tables.clone(),
            destination: tables,
            lock: Arc::new(PgLock::new(pool)),
        }
    }

    /// Every seam served by one in-memory store
    #[cfg(test)]
    pub fn memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            queue: store.clone(),
            source: store.clone(),
            destination: store.clone(),
            lock: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
