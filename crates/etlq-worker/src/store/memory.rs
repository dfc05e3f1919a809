//! In-memory implementation of every store seam
//!
//! Used by the unit tests of the queue, the engine and the driver. Supports
//! failure injection per operation and per-row load rejection so retry and
//! failure paths can be exercised without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use super::{DestinationWriter, DistributedLock, LoadReport, QueueStore, SourceReader};
use crate::error::{StoreError, StoreResult};
use crate::queue::{BatchRange, QueueItem, QueueProgress, QueueStatus, TransferPair};
use crate::transfer::{FieldValue, Row, ID_COLUMN};

/// Store operations that can be counted and made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enqueue,
    ClaimNext,
    SetStatus,
    HighWatermark,
    SourceIds,
    FetchRange,
    LoadBatch,
    TryAcquire,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, BTreeMap<i64, Row>>,
    queue: Vec<QueueItem>,
    next_id: i64,
    pending_failures: HashMap<Operation, u32>,
    calls: HashMap<Operation, u32>,
    rejected: HashSet<(String, i64)>,
    /// Key to holder and lease expiry
    locks: HashMap<String, (String, Instant)>,
}

impl State {
    /// Count a call and consume one injected failure, if any
    fn check(&mut self, op: Operation) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;

        match self.pending_failures.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Unavailable(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }

    fn item_mut(&mut self, id: i64) -> StoreResult<&mut QueueItem> {
        self.queue
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

/// Lock holder identity of the store's own callers
const OWNER: &str = "memory";

fn same_pair(item: &QueueItem, pair: &TransferPair) -> bool {
    item.source_table == pair.source_table && item.destination_table == pair.destination_table
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace rows of `table`, keyed by their `id`
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state();
        let table = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.id() {
                table.insert(id, row);
            }
        }
    }

    /// Rows of `table` in id order
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: i64) -> Option<Row> {
        self.state().tables.get(table)?.get(&id).cloned()
    }

    /// Every queue item in insertion order
    pub fn queue_items(&self) -> Vec<QueueItem> {
        self.state().queue.clone()
    }

    pub fn queue_item(&self, id: i64) -> Option<QueueItem> {
        self.state().queue.iter().find(|item| item.id == id).cloned()
    }

    /// Make the next `times` calls of `op` fail with a transient error
    pub fn fail_next(&self, op: Operation, times: u32) {
        self.state().pending_failures.insert(op, times);
    }

    /// Make every load of row `id` into `table` fail with a non-conflict error
    pub fn reject_id(&self, table: &str, id: i64) {
        self.state().rejected.insert((table.to_string(), id));
    }

    /// Number of calls made to `op`, failed ones included
    pub fn calls(&self, op: Operation) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Give `key` to another process for `ttl`
    pub fn hold_lock(&self, key: &str, owner: &str, ttl: Duration) {
        self.state()
            .locks
            .insert(key.to_string(), (owner.to_string(), Instant::now() + ttl));
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryStore")
            .field("tables", &state.tables.len())
            .field("queue", &state.queue.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(
        &self,
        pair: &TransferPair,
        batch_size: u32,
        range: BatchRange,
    ) -> StoreResult<QueueItem> {
        let mut state = self.state();
        state.check(Operation::Enqueue)?;

        state.next_id += 1;
        let item = QueueItem {
            id: state.next_id,
            source_table: pair.source_table.clone(),
            destination_table: pair.destination_table.clone(),
            batch_size,
            start_id: range.start_id,
            last_id: range.last_id,
            status: QueueStatus::Waiting,
            cluster_id: range.cluster_id,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error_message: None,
        };
        state.queue.push(item.clone());
        Ok(item)
    }

    async fn claim_next(
        &self,
        pair: &TransferPair,
        cluster_id: u32,
    ) -> StoreResult<Option<QueueItem>> {
        let mut state = self.state();
        state.check(Operation::ClaimNext)?;

        let next = state.queue.iter_mut().find(|item| {
            item.status == QueueStatus::Waiting
                && item.cluster_id == cluster_id
                && same_pair(item, pair)
        });

        Ok(next.map(|item| {
            item.status = QueueStatus::Running;
            item.started_at = Some(Utc::now());
            item.clone()
        }))
    }

    async fn set_status(
        &self,
        id: i64,
        status: QueueStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state();
        state.check(Operation::SetStatus)?;

        let item = state.item_mut(id)?;
        if item.status == status {
            return Ok(());
        }
        if !item.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: item.status,
                to: status,
            });
        }

        item.status = status;
        match status {
            QueueStatus::Running => item.started_at = Some(Utc::now()),
            QueueStatus::Completed => item.ended_at = Some(Utc::now()),
            QueueStatus::Failed => {
                item.error_message = error_message.map(str::to_string);
                item.attempts += 1;
            }
            QueueStatus::Waiting => {
                item.started_at = None;
                item.ended_at = None;
            }
        }
        Ok(())
    }

    async fn high_watermark(&self, pair: &TransferPair) -> StoreResult<Option<i64>> {
        let mut state = self.state();
        state.check(Operation::HighWatermark)?;

        Ok(state
            .queue
            .iter()
            .filter(|item| same_pair(item, pair))
            .map(|item| item.last_id)
            .max())
    }

    async fn progress(&self, pair: &TransferPair) -> StoreResult<QueueProgress> {
        let state = self.state();
        let mut progress = QueueProgress::default();
        for item in state.queue.iter().filter(|item| same_pair(item, pair)) {
            progress.record(item.status, 1);
        }
        Ok(progress)
    }

    async fn requeue_failed(&self, pair: &TransferPair) -> StoreResult<u64> {
        let mut state = self.state();
        let mut moved = 0;
        for item in state
            .queue
            .iter_mut()
            .filter(|item| item.status == QueueStatus::Failed && same_pair(item, pair))
        {
            item.status = QueueStatus::Waiting;
            item.started_at = None;
            item.ended_at = None;
            moved += 1;
        }
        Ok(moved)
    }

    async fn requeue_running(&self, pair: &TransferPair) -> StoreResult<u64> {
        let mut state = self.state();
        let mut moved = 0;
        for item in state
            .queue
            .iter_mut()
            .filter(|item| item.status == QueueStatus::Running && same_pair(item, pair))
        {
            item.status = QueueStatus::Waiting;
            item.started_at = None;
            moved += 1;
        }
        Ok(moved)
    }

    async fn clear(&self, pair: &TransferPair) -> StoreResult<u64> {
        let mut state = self.state();
        let before = state.queue.len();
        state.queue.retain(|item| !same_pair(item, pair));
        Ok((before - state.queue.len()) as u64)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<QueueItem>> {
        Ok(self.queue_item(id))
    }
}

#[async_trait]
impl SourceReader for MemoryStore {
    async fn source_ids(&self, table: &str) -> StoreResult<Vec<i64>> {
        let mut state = self.state();
        state.check(Operation::SourceIds)?;

        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn fetch_range(
        &self,
        table: &str,
        start_id: i64,
        last_id: i64,
        limit: u32,
    ) -> StoreResult<Vec<Row>> {
        let mut state = self.state();
        state.check(Operation::FetchRange)?;

        if start_id > last_id {
            return Ok(Vec::new());
        }

        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.range(start_id..=last_id)
                    .take(limit as usize)
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl DestinationWriter for MemoryStore {
    async fn load_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> StoreResult<LoadReport> {
        let mut state = self.state();
        state.check(Operation::LoadBatch)?;

        // Work on a copy so a failing row leaves the table untouched
        let mut staged = state.tables.get(table).cloned().unwrap_or_default();
        let mut report = LoadReport::default();

        for row in rows {
            let id = row
                .id()
                .ok_or_else(|| StoreError::decode("destination row", "row has no integer id"))?;

            if state.rejected.contains(&(table.to_string(), id)) {
                return Err(StoreError::Rejected {
                    table: table.to_string(),
                    id,
                    message: "row refused by destination".to_string(),
                });
            }

            let value_of = |column: &str| row.get(column).cloned().unwrap_or(FieldValue::Null);

            match staged.get_mut(&id) {
                Some(existing) => {
                    for column in columns.iter().filter(|c| c.as_str() != ID_COLUMN) {
                        existing.insert(column.clone(), value_of(column));
                    }
                    report.updated += 1;
                }
                None => {
                    let fresh: Row = columns
                        .iter()
                        .map(|column| (column.clone(), value_of(column)))
                        .collect();
                    staged.insert(id, fresh);
                    report.inserted += 1;
                }
            }
        }

        state.tables.insert(table.to_string(), staged);
        Ok(report)
    }

    async fn clear_table(&self, table: &str) -> StoreResult<u64> {
        let mut state = self.state();
        Ok(state
            .tables
            .get_mut(table)
            .map(|rows| {
                let count = rows.len() as u64;
                rows.clear();
                count
            })
            .unwrap_or(0))
    }
}

#[async_trait]
impl DistributedLock for MemoryStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state();
        state.check(Operation::TryAcquire)?;

        // Free, expired, or already ours
        let now = Instant::now();
        match state.locks.get(key) {
            Some((owner, expires_at)) if owner != OWNER && *expires_at > now => Ok(false),
            _ => {
                state.locks.insert(key.to_string(), (OWNER.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> StoreResult<()> {
        let mut state = self.state();
        if state.locks.get(key).is_some_and(|(owner, _)| owner == OWNER) {
            state.locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn columns() -> Vec<String> {
        vec!["id".to_string(), "name".to_string()]
    }

    #[tokio::test]
    async fn test_load_inserts_then_updates() {
        let store = MemoryStore::new();
        let rows = vec![Row::new().with("id", 1i64).with("name", "first")];
        let report = store.load_batch("people", &columns(), &rows).await.unwrap();
        assert_eq!(report, LoadReport { inserted: 1, updated: 0 });

        let rows = vec![Row::new().with("id", 1i64).with("name", "second")];
        let report = store.load_batch("people", &columns(), &rows).await.unwrap();
        assert_eq!(report, LoadReport { inserted: 0, updated: 1 });

        let all = store.rows("people");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("name").and_then(|v| v.as_str()), Some("second"));
    }

    #[tokio::test]
    async fn test_rejected_row_rolls_back_whole_batch() {
        let store = MemoryStore::new();
        store.reject_id("people", 2);

        let rows = vec![
            Row::new().with("id", 1i64).with("name", "a"),
            Row::new().with("id", 2i64).with("name", "b"),
        ];
        let err = store.load_batch("people", &columns(), &rows).await.unwrap_err();

        assert!(matches!(err, StoreError::Rejected { id: 2, .. }));
        assert!(store.rows("people").is_empty());
    }

    #[tokio::test]
    async fn test_missing_columns_load_as_null() {
        let store = MemoryStore::new();
        let rows = vec![Row::new().with("id", 5i64)];
        store.load_batch("people", &columns(), &rows).await.unwrap();

        let row = store.row("people", 5).unwrap();
        assert!(row.get("name").unwrap().is_null());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(Operation::SourceIds, 1);

        assert!(store.source_ids("people").await.is_err());
        assert!(store.source_ids("people").await.is_ok());
        assert_eq!(store.calls(Operation::SourceIds), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_lock_blocks_until_expired() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store.hold_lock("populate", "worker-b", ttl);

        assert!(!store.try_acquire("populate", ttl).await.unwrap());
        // Releasing a lease held by someone else changes nothing
        store.release("populate").await.unwrap();
        assert!(!store.try_acquire("populate", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.try_acquire("populate", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_own_lock_can_be_reacquired_and_released() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("populate", ttl).await.unwrap());
        assert!(store.try_acquire("populate", ttl).await.unwrap());

        store.release("populate").await.unwrap();
        store.hold_lock("populate", "worker-b", ttl);
        assert!(!store.try_acquire("populate", ttl).await.unwrap());
    }
}
