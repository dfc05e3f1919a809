//! Transfer engine: population and the extract / transform / load cycle
//!
//! One engine moves one [`TransferSpec`]. Cluster member 0 populates the
//! queue from source ids newer than the high watermark; every member then
//! drains its own partition, one batch at a time.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::partition::Partitioner;
use super::row::Row;
use super::spec::TransferSpec;
use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult, StoreError};
use crate::queue::{DrainReport, FailurePolicy, QueueItem, TransferPair, WorkQueue};
use crate::store::{DestinationWriter, DistributedLock, LoadReport, SourceReader, Stores};

/// Per-process knobs shared by every engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub batch_size: NonZeroU32,
    pub cluster_id: u32,
    pub cluster_size: u32,
    /// Startup delay per unit of cluster id
    pub stagger: Duration,
    pub backoff: BackoffPolicy,
    /// Keep polling for new batches this long after the first drain
    pub linger: Duration,
    pub poll_interval: Duration,
    /// Lease on the population lock; `None` populates without locking
    pub populate_lock_ttl: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: NonZeroU32::MIN.saturating_add(9),
            cluster_id: 0,
            cluster_size: 0,
            stagger: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            linger: Duration::ZERO,
            poll_interval: Duration::from_secs(20),
            populate_lock_ttl: Some(Duration::from_secs(300)),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EtlConfig) -> EtlResult<Self> {
        let batch_size = NonZeroU32::new(config.batch_size)
            .ok_or_else(|| EtlError::Config("batch size must be greater than 0".to_string()))?;

        Ok(Self {
            batch_size,
            cluster_id: config.cluster_id,
            cluster_size: config.cluster_size,
            stagger: Duration::from_secs(config.stagger_secs),
            backoff: config.backoff(),
            linger: Duration::from_secs(config.linger_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            populate_lock_ttl: (config.populate_lock_ttl_secs > 0)
                .then(|| Duration::from_secs(config.populate_lock_ttl_secs)),
        })
    }

    /// Whether this process is the member that populates the queue
    pub fn is_populator(&self) -> bool {
        self.cluster_id == 0
    }
}

/// What one population pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PopulateReport {
    pub source_ids: usize,
    pub previous_watermark: Option<i64>,
    pub batches: usize,
    pub new_ids: usize,
}

/// What one batch handler call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// No source rows in the range
    Empty,
    /// The transform produced no rows
    NoOutput { fetched: usize },
    Loaded { fetched: usize, load: LoadReport },
}

pub struct TransferEngine {
    spec: TransferSpec,
    columns: Vec<String>,
    queue: WorkQueue,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn DestinationWriter>,
    lock: Arc<dyn DistributedLock>,
    settings: EngineSettings,
}

impl TransferEngine {
    pub fn new(spec: TransferSpec, stores: &Stores, settings: EngineSettings) -> Self {
        let queue = WorkQueue::new(stores.queue.clone(), spec.pair(), settings.batch_size.get())
            .with_backoff(settings.backoff);

        Self {
            columns: spec.destination_columns(),
            spec,
            queue,
            source: stores.source.clone(),
            destination: stores.destination.clone(),
            lock: stores.lock.clone(),
            settings,
        }
    }

    pub fn spec(&self) -> &TransferSpec {
        &self.spec
    }

    pub fn pair(&self) -> &TransferPair {
        self.queue.pair()
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Enqueue batches for every source id above the high watermark
    ///
    /// Safe to call repeatedly: with no new source rows it does nothing.
    /// Batches are enqueued in ascending order so that an interrupted run
    /// leaves a watermark with no gaps below it.
    pub async fn populate(&self) -> EtlResult<PopulateReport> {
        let pair = self.pair();
        let backoff = self.settings.backoff;
        info!("Populating queue for {}", pair);

        let ids = backoff
            .execute_if(
                "source_ids",
                || self.source.source_ids(&self.spec.source_table),
                StoreError::is_transient,
            )
            .await?;
        let watermark = backoff
            .execute_if("high_watermark", || self.queue.high_watermark(), StoreError::is_transient)
            .await?;

        let mut report = PopulateReport {
            source_ids: ids.len(),
            previous_watermark: watermark,
            ..PopulateReport::default()
        };

        if let (Some(mark), Some(latest)) = (watermark, ids.last()) {
            if mark >= *latest {
                info!(last_id = mark, "No new records to populate queue for {}", pair);
                return Ok(report);
            }
        }

        let partitioner = Partitioner::new(self.settings.batch_size, self.settings.cluster_size);
        let batches = partitioner.partition(&ids, watermark);
        if batches.is_empty() {
            info!("No source records to populate queue for {}", pair);
            return Ok(report);
        }

        report.new_ids = match watermark {
            Some(mark) => ids.len() - ids.partition_point(|id| *id <= mark),
            None => ids.len(),
        };
        info!(
            records = report.new_ids,
            batches = batches.len(),
            "Populating queue with {} records",
            report.new_ids
        );

        for batch in &batches {
            backoff
                .execute_if(
                    "enqueue",
                    || self.queue.enqueue(batch.start_id, batch.last_id, batch.cluster_id),
                    StoreError::is_transient,
                )
                .await?;
            report.batches += 1;
        }

        info!(batches = report.batches, "Queue population finished for {}", pair);
        Ok(report)
    }

    /// Populate under the per-pair lock when one is configured
    ///
    /// Returns `None` when another process holds the lock.
    pub async fn populate_guarded(&self) -> EtlResult<Option<PopulateReport>> {
        let Some(ttl) = self.settings.populate_lock_ttl else {
            return self.populate().await.map(Some);
        };

        let key = format!(
            "etl:populate:{}:{}",
            self.spec.source_table, self.spec.destination_table
        );
        let acquired = self
            .settings
            .backoff
            .execute_if("lock", || self.lock.try_acquire(&key, ttl), StoreError::is_transient)
            .await?;

        if !acquired {
            warn!(lock = %key, "Population of {} already running elsewhere, skipping", self.pair());
            return Ok(None);
        }

        let result = self.populate().await;

        if let Err(err) = self.lock.release(&key).await {
            warn!(lock = %key, error = %err, "Failed to release population lock");
        }

        result.map(Some)
    }

    /// Populate when this is member 0, then process this member's batches
    pub async fn start(&self) -> EtlResult<DrainReport> {
        info!(
            cluster_id = self.settings.cluster_id,
            "Starting ETL process for {} on cluster #{}",
            self.pair(),
            self.settings.cluster_id
        );

        if self.settings.is_populator() {
            self.populate_guarded().await?;
            info!("Population done for {}, handing off to the queue", self.pair());
        }

        self.process().await
    }

    /// Stagger, drain, then keep draining until the linger window closes
    pub async fn process(&self) -> EtlResult<DrainReport> {
        let stagger = self.settings.stagger.saturating_mul(self.settings.cluster_id);
        if !stagger.is_zero() {
            debug!(delay_ms = stagger.as_millis() as u64, "Staggering start");
            tokio::time::sleep(stagger).await;
        }

        let started = Instant::now();
        let mut report = self.drain().await?;

        while started.elapsed() < self.settings.linger {
            tokio::time::sleep(self.settings.poll_interval).await;
            info!("ETL process for {} waiting for more records to process...", self.pair());
            report += self.drain().await?;
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            "No more records for {}",
            self.pair()
        );
        Ok(report)
    }

    /// One pass over this member's WAITING items; the first failed batch is fatal
    pub async fn drain(&self) -> EtlResult<DrainReport> {
        let backoff = self.settings.backoff;

        self.queue
            .drain(self.settings.cluster_id, FailurePolicy::Halt, |item| async move {
                backoff
                    .execute_if("handle_batch", || self.handle_batch(&item), EtlError::is_retryable)
                    .await
                    .map(|_| ())
            })
            .await
    }

    /// Extract, transform and load the rows of one queue item
    pub async fn handle_batch(&self, item: &QueueItem) -> EtlResult<BatchOutcome> {
        let backoff = self.settings.backoff;
        let source_table = &self.spec.source_table;

        let rows = backoff
            .execute_if(
                "fetch_range",
                || {
                    self.source.fetch_range(
                        source_table,
                        item.start_id,
                        item.last_id,
                        self.settings.batch_size.get(),
                    )
                },
                StoreError::is_transient,
            )
            .await?;

        if rows.is_empty() {
            debug!(queue_item_id = item.id, "No source rows in range");
            return Ok(BatchOutcome::Empty);
        }

        let fetched = rows.len();
        info!(
            queue_item_id = item.id,
            rows = fetched,
            "Processing range: [{}] {} - {}",
            source_table,
            rows.first().and_then(Row::id).unwrap_or(item.start_id),
            rows.last().and_then(Row::id).unwrap_or(item.last_id)
        );

        let transformed = self
            .spec
            .transform
            .transform(rows)
            .await
            .map_err(|err| EtlError::Transform {
                source_table: source_table.clone(),
                message: format!("{:#}", err),
            })?;

        if transformed.is_empty() {
            warn!(queue_item_id = item.id, "No new records to process in {}", source_table);
            return Ok(BatchOutcome::NoOutput { fetched });
        }

        let load = backoff
            .execute_if(
                "load_batch",
                || {
                    self.destination
                        .load_batch(&self.spec.destination_table, &self.columns, &transformed)
                },
                StoreError::is_transient,
            )
            .await?;

        debug!(
            queue_item_id = item.id,
            inserted = load.inserted,
            updated = load.updated,
            "Batch loaded into {}",
            self.spec.destination_table
        );
        Ok(BatchOutcome::Loaded { fetched, load })
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("spec", &self.spec)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
