//! Durable, cluster-partitioned work queue

mod types;
mod work_queue;

pub use types::{
    BatchRange, DrainReport, FailurePolicy, QueueItem, QueueProgress, QueueStatus, TransferPair,
};
pub use work_queue::{WorkQueue, UNKNOWN_FAILURE};
