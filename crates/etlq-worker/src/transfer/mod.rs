//! Batch transfer: rows, the module contract, partitioning, retries and the engine

mod backoff;
mod engine;
pub mod helpers;
mod partition;
mod row;
mod shape;
mod spec;

pub use backoff::{BackoffPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_RETRIES};
pub use engine::{BatchOutcome, EngineSettings, PopulateReport, TransferEngine};
pub use partition::{cluster_for, fnv1a_32, Partitioner};
pub use row::{DestinationRow, FieldValue, Row, SourceRow, ID_COLUMN};
pub use shape::{shape_optional, shape_value, ShapedValue, DATETIME_FORMAT};
pub use spec::{ColumnMapping, ColumnRename, FnTransform, Transform, TransferSpec};
