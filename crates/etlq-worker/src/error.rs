//! Error types for the queue and transfer engine

use thiserror::Error;

use crate::queue::QueueStatus;

/// Postgres SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type EtlResult<T> = std::result::Result<T, EtlError>;

/// Failures raised by the store adapters (queue table, source and destination tables)
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Queue item {0} not found")]
    NotFound(i64),

    #[error("Queue item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("Invalid batch range: start_id {start_id} is greater than last_id {last_id}")]
    InvalidRange { start_id: i64, last_id: i64 },

    #[error("Failed to decode {context}: {message}")]
    Decode { context: String, message: String },

    /// A row was refused by the destination for a reason other than a key collision
    #[error("Row {id} rejected by {table}: {message}")]
    Rejected {
        table: String,
        id: i64,
        message: String,
    },

    /// The destination table does not look the way the column map expects
    #[error("Schema mismatch: {0}")]
    Schema(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn decode(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Whether this is a unique violation on the primary key
    ///
    /// `constraint` is the key's real name when the caller knows it;
    /// otherwise Postgres' default `<table>_pkey` naming is assumed.
    pub fn is_primary_key_violation(&self, constraint: Option<&str>) -> bool {
        let StoreError::Sqlx(sqlx::Error::Database(db)) = self else {
            return false;
        };
        if db.code().as_deref() != Some(UNIQUE_VIOLATION) {
            return false;
        }
        match (db.constraint(), constraint) {
            (Some(name), Some(expected)) => name == expected,
            (Some(name), None) => name.ends_with("_pkey"),
            (None, _) => false,
        }
    }

    /// Whether a retry has a reasonable chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlx(sqlx::Error::Database(db)) => {
                db.code().as_deref().is_some_and(is_transient_sqlstate)
            }
            StoreError::Sqlx(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Serialization failures, deadlocks, lock timeouts, shutdowns and lost connections
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "55P03" | "57P01" | "57P03") || code.starts_with("08")
}

/// Errors surfaced by the transfer engine and the process driver
#[derive(Error, Debug)]
pub enum EtlError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Transform for {source_table} failed: {message}")]
    Transform {
        source_table: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown module '{name}' (registered: {registered})")]
    UnknownModule { name: String, registered: String },

    #[error("Invalid transfer spec for module '{module}': {reason}")]
    InvalidSpec { module: String, reason: String },

    /// A batch exhausted its retries and was recorded FAILED; fatal to the worker's run
    #[error("Batch {queue_item_id} [{start_id}, {last_id}] of {pair} failed: {reason}")]
    BatchFailed {
        pair: String,
        queue_item_id: i64,
        start_id: i64,
        last_id: i64,
        reason: String,
    },
}

impl EtlError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EtlError::BatchFailed { .. })
    }

    /// Whether the batch handler should try again
    ///
    /// Store errors retry only when transient; everything else retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            EtlError::Store(err) => err.is_transient(),
            _ => true,
        }
    }
}

impl From<etlq_common::ConfigError> for EtlError {
    fn from(err: etlq_common::ConfigError) -> Self {
        EtlError::Config(err.to_string())
    }
}
