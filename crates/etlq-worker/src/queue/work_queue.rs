//! Work queue for one transfer pair
//!
//! Wraps a [`QueueStore`] with the pair and batch size baked in and runs the
//! claim / handle / record loop every cluster member uses to drain its share
//! of the queue.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::types::{
    BatchRange, DrainReport, FailurePolicy, QueueItem, QueueProgress, QueueStatus, TransferPair,
};
use crate::error::{EtlError, EtlResult, StoreError, StoreResult};
use crate::store::QueueStore;
use crate::transfer::BackoffPolicy;

/// Recorded when a failure arrives without a message, so FAILED rows always carry one
pub const UNKNOWN_FAILURE: &str = "unknown error";

pub struct WorkQueue {
    store: Arc<dyn QueueStore>,
    pair: TransferPair,
    batch_size: u32,
    backoff: BackoffPolicy,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn QueueStore>, pair: TransferPair, batch_size: u32) -> Self {
        Self {
            store,
            pair,
            batch_size,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Retry policy applied to the drain loop's own store calls
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pair(&self) -> &TransferPair {
        &self.pair
    }

    /// Insert one WAITING item covering `[start_id, last_id]`
    pub async fn enqueue(&self, start_id: i64, last_id: i64, cluster_id: u32) -> StoreResult<QueueItem> {
        if start_id > last_id {
            return Err(StoreError::InvalidRange { start_id, last_id });
        }

        let range = BatchRange {
            start_id,
            last_id,
            cluster_id,
        };
        let item = self.store.enqueue(&self.pair, self.batch_size, range).await?;

        debug!(
            queue_item_id = item.id,
            start_id,
            last_id,
            cluster_id,
            "Enqueued batch for {}",
            self.pair
        );
        Ok(item)
    }

    /// Claim the oldest WAITING item of `cluster_id`, moving it to RUNNING
    pub async fn claim_next(&self, cluster_id: u32) -> StoreResult<Option<QueueItem>> {
        self.store.claim_next(&self.pair, cluster_id).await
    }

    pub async fn set_status(
        &self,
        id: i64,
        status: QueueStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let error_message = match status {
            QueueStatus::Failed => Some(
                error_message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or(UNKNOWN_FAILURE),
            ),
            _ => None,
        };
        self.store.set_status(id, status, error_message).await
    }

    pub async fn mark_completed(&self, id: i64) -> StoreResult<()> {
        self.set_status(id, QueueStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, id: i64, error_message: &str) -> StoreResult<()> {
        self.set_status(id, QueueStatus::Failed, Some(error_message)).await
    }

    /// Highest `last_id` ever enqueued for this pair
    pub async fn high_watermark(&self) -> StoreResult<Option<i64>> {
        self.store.high_watermark(&self.pair).await
    }

    pub async fn progress(&self) -> StoreResult<QueueProgress> {
        self.store.progress(&self.pair).await
    }

    pub async fn requeue_failed(&self) -> StoreResult<u64> {
        self.store.requeue_failed(&self.pair).await
    }

    /// Release items a crashed worker left RUNNING
    pub async fn requeue_running(&self) -> StoreResult<u64> {
        self.store.requeue_running(&self.pair).await
    }

    pub async fn clear(&self) -> StoreResult<u64> {
        self.store.clear(&self.pair).await
    }

    /// Process every WAITING item of `cluster_id` until none is left
    ///
    /// Each claimed item is handed to `handler`; success records COMPLETED,
    /// failure records FAILED with the error text. With
    /// [`FailurePolicy::Halt`] the first failure ends the drain with
    /// [`EtlError::BatchFailed`] after it has been recorded.
    pub async fn drain<F, Fut>(
        &self,
        cluster_id: u32,
        policy: FailurePolicy,
        mut handler: F,
    ) -> EtlResult<DrainReport>
    where
        F: FnMut(QueueItem) -> Fut,
        Fut: Future<Output = EtlResult<()>>,
    {
        info!(cluster_id, "Processing queue {}", self.pair);

        let mut report = DrainReport::default();

        loop {
            let claimed = self
                .backoff
                .execute_if("claim_next", || self.claim_next(cluster_id), StoreError::is_transient)
                .await?;

            let Some(item) = claimed else {
                break;
            };

            let (id, start_id, last_id) = (item.id, item.start_id, item.last_id);
            debug!(queue_item_id = id, start_id, last_id, cluster_id, "Claimed batch");

            match handler(item).await {
                Ok(()) => {
                    self.backoff
                        .execute_if(
                            "mark_completed",
                            || self.mark_completed(id),
                            StoreError::is_transient,
                        )
                        .await?;
                    report.completed += 1;
                }
                Err(err) => {
                    let reason = err.to_string();
                    error!(
                        queue_item_id = id,
                        start_id,
                        last_id,
                        cluster_id,
                        error = %reason,
                        "Error processing range {} - {} of {}",
                        start_id,
                        last_id,
                        self.pair
                    );

                    self.backoff
                        .execute_if(
                            "mark_failed",
                            || self.mark_failed(id, &reason),
                            StoreError::is_transient,
                        )
                        .await?;
                    report.failed += 1;

                    if policy == FailurePolicy::Halt {
                        return Err(EtlError::BatchFailed {
                            pair: self.pair.to_string(),
                            queue_item_id: id,
                            start_id,
                            last_id,
                            reason,
                        });
                    }
                }
            }
        }

        info!(
            cluster_id,
            completed = report.completed,
            failed = report.failed,
            "Queue drained for {}",
            self.pair
        );
        Ok(report)
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("pair", &self.pair)
            .field("batch_size", &self.batch_size)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
