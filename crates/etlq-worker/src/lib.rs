//! ETLQ Worker Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves rows from legacy source tables into destination tables in batches,
//! coordinated through a work queue table shared by every worker process.
//!
//! # Overview
//!
//! - **Work queue**: `etl_queue` rows describe id ranges of one source/destination
//!   pair; workers claim them atomically and record the outcome
//! - **Partitioning**: batches are spread over cluster members by a stable
//!   hash of their start id
//! - **Transfer engine**: populate the queue (member 0), then extract,
//!   transform and load each claimed batch with retries and exponential backoff
//! - **Process driver**: runs one engine per configured module in parallel
//!
//! # Architecture
//!
//! Storage sits behind the traits in [`store`]; [`db`] implements them on
//! PostgreSQL with SQLx, and the unit tests run against an in-memory
//! implementation. Transfer modules are plain [`transfer::TransferSpec`]
//! values registered by name in [`registry`].
//!
//! # Example
//!
//! ```no_run
//! use etlq_worker::{config::Config, db, driver::Driver, registry::ModuleRegistry, store::Stores};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::ensure_schema(&pool).await?;
//!
//!     let driver = Driver::from_config(&config.etl, &ModuleRegistry::builtin(), Stores::postgres(pool))?;
//!     let report = driver.run().await;
//!     anyhow::ensure!(report.is_success(), "ETL run failed");
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod modules;
pub mod queue;
pub mod registry;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::{Config, EtlConfig};
pub use driver::{Driver, RunReport};
pub use error::{EtlError, EtlResult, StoreError, StoreResult};
pub use queue::{QueueItem, QueueStatus, TransferPair, WorkQueue};
pub use registry::ModuleRegistry;
pub use store::Stores;
pub use transfer::{TransferEngine, TransferSpec};
