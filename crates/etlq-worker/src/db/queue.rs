//! Postgres-backed queue store on the `etl_queue` table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etlq_common::logging::SQL_TARGET;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::queue::{BatchRange, QueueItem, QueueProgress, QueueStatus, TransferPair};
use crate::store::QueueStore;

const ITEM_COLUMNS: &str = "id, source_table, destination_table, batch_size, start_id, last_id, \
     status, cluster_id, attempts, created_at, started_at, ended_at, error_message";

#[derive(Debug, FromRow)]
struct QueueItemRow {
    id: i64,
    source_table: String,
    destination_table: String,
    batch_size: i32,
    start_id: i64,
    last_id: i64,
    status: String,
    cluster_id: i32,
    attempts: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let non_negative = |field: &str, value: i32| {
            u32::try_from(value).map_err(|_| {
                StoreError::decode(
                    format!("etl_queue.{} of item {}", field, row.id),
                    format!("negative value {}", value),
                )
            })
        };

        Ok(QueueItem {
            id: row.id,
            batch_size: non_negative("batch_size", row.batch_size)?,
            cluster_id: non_negative("cluster_id", row.cluster_id)?,
            attempts: non_negative("attempts", row.attempts)?,
            status: row.status.parse()?,
            source_table: row.source_table,
            destination_table: row.destination_table,
            start_id: row.start_id,
            last_id: row.last_id,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error_message: row.error_message,
        })
    }
}

fn to_i32(context: &str, value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::decode(context, format!("{} does not fit INT", value)))
}

/// Queue store over a shared pool
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_status(&self, id: i64) -> StoreResult<Option<QueueStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM etl_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        status.map(|s| s.parse()).transpose()
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(
        &self,
        pair: &TransferPair,
        batch_size: u32,
        range: BatchRange,
    ) -> StoreResult<QueueItem> {
        let query = format!(
            "INSERT INTO etl_queue \
                 (source_table, destination_table, batch_size, start_id, last_id, status, cluster_id, attempts) \
             VALUES ($1, $2, $3, $4, $5, 'WAITING', $6, 0) \
             RETURNING {ITEM_COLUMNS}"
        );
        debug!(
            target: SQL_TARGET,
            %pair,
            start_id = range.start_id,
            last_id = range.last_id,
            cluster_id = range.cluster_id,
            "[INSERT] {}",
            query
        );

        let row: QueueItemRow = sqlx::query_as(&query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .bind(to_i32("batch_size", batch_size)?)
            .bind(range.start_id)
            .bind(range.last_id)
            .bind(to_i32("cluster_id", range.cluster_id)?)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn claim_next(
        &self,
        pair: &TransferPair,
        cluster_id: u32,
    ) -> StoreResult<Option<QueueItem>> {
        // Select and transition in one statement; SKIP LOCKED lets concurrent
        // claimers pass over a row another transaction is taking
        let query = format!(
            "UPDATE etl_queue SET status = 'RUNNING', started_at = now() \
             WHERE id = ( \
                 SELECT id FROM etl_queue \
                 WHERE source_table = $1 AND destination_table = $2 \
                   AND cluster_id = $3 AND status = 'WAITING' \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) AND status = 'WAITING' \
             RETURNING {ITEM_COLUMNS}"
        );
        debug!(target: SQL_TARGET, %pair, cluster_id, "[UPDATE] {}", query);

        let row: Option<QueueItemRow> = sqlx::query_as(&query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .bind(to_i32("cluster_id", cluster_id)?)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueItem::try_from).transpose()
    }

    async fn set_status(
        &self,
        id: i64,
        status: QueueStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let query = "UPDATE etl_queue SET \
                 status = $2::text, \
                 started_at = CASE WHEN $2::text = 'RUNNING' THEN now() \
                                   WHEN $2::text = 'WAITING' THEN NULL ELSE started_at END, \
                 ended_at = CASE WHEN $2::text = 'COMPLETED' THEN now() \
                                 WHEN $2::text = 'WAITING' THEN NULL ELSE ended_at END, \
                 error_message = CASE WHEN $2::text = 'FAILED' THEN $3 ELSE error_message END, \
                 attempts = CASE WHEN $2::text = 'FAILED' THEN attempts + 1 ELSE attempts END \
             WHERE id = $1 AND status = ANY($4)";

        let predecessors: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        debug!(
            target: SQL_TARGET,
            queue_item_id = id,
            status = status.as_str(),
            error_message,
            "[UPDATE] {}",
            query
        );

        let result = sqlx::query(query)
            .bind(id)
            .bind(status.as_str())
            .bind(error_message)
            .bind(&predecessors)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing moved: the item is missing, already there, or somewhere else
        match self.current_status(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(current) if current == status => Ok(()),
            Some(current) => Err(StoreError::InvalidTransition {
                id,
                from: current,
                to: status,
            }),
        }
    }

    async fn high_watermark(&self, pair: &TransferPair) -> StoreResult<Option<i64>> {
        let query = "SELECT MAX(last_id) FROM etl_queue \
                     WHERE source_table = $1 AND destination_table = $2";
        debug!(target: SQL_TARGET, %pair, "[SELECT] {}", query);

        let watermark: Option<i64> = sqlx::query_scalar(query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .fetch_one(&self.pool)
            .await?;

        Ok(watermark)
    }

    async fn progress(&self, pair: &TransferPair) -> StoreResult<QueueProgress> {
        let query = "SELECT status, COUNT(*) FROM etl_queue \
                     WHERE source_table = $1 AND destination_table = $2 \
                     GROUP BY status";
        debug!(target: SQL_TARGET, %pair, "[SELECT] {}", query);

        let counts: Vec<(String, i64)> = sqlx::query_as(query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .fetch_all(&self.pool)
            .await?;

        let mut progress = QueueProgress::default();
        for (status, count) in counts {
            progress.record(status.parse()?, count);
        }
        Ok(progress)
    }

    async fn requeue_failed(&self, pair: &TransferPair) -> StoreResult<u64> {
        let query = "UPDATE etl_queue \
                     SET status = 'WAITING', started_at = NULL, ended_at = NULL \
                     WHERE source_table = $1 AND destination_table = $2 AND status = 'FAILED'";
        debug!(target: SQL_TARGET, %pair, "[UPDATE] {}", query);

        let result = sqlx::query(query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_running(&self, pair: &TransferPair) -> StoreResult<u64> {
        let query = "UPDATE etl_queue \
                     SET status = 'WAITING', started_at = NULL \
                     WHERE source_table = $1 AND destination_table = $2 AND status = 'RUNNING'";
        debug!(target: SQL_TARGET, %pair, "[UPDATE] {}", query);

        let result = sqlx::query(query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn clear(&self, pair: &TransferPair) -> StoreResult<u64> {
        let query = "DELETE FROM etl_queue WHERE source_table = $1 AND destination_table = $2";
        debug!(target: SQL_TARGET, %pair, "[DELETE] {}", query);

        let result = sqlx::query(query)
            .bind(&pair.source_table)
            .bind(&pair.destination_table)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: i64) -> StoreResult<Option<QueueItem>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM etl_queue WHERE id = $1");
        debug!(target: SQL_TARGET, queue_item_id = id, "[SELECT] {}", query);

        let row: Option<QueueItemRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueItem::try_from).transpose()
    }
}
