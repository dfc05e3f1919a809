//! ETLQ Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ambient pieces shared by the ETLQ workspace members.
//!
//! # Overview
//!
//! - **Logging**: tracing subscriber setup with console/file output and a
//!   dedicated SQL statement log
//! - **Configuration**: strict environment variable parsing and the shared
//!   configuration error type
//!
//! # Example
//!
//! ```no_run
//! use etlq_common::env;
//! use etlq_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let batch_size: usize = env::var_or("ETL_BATCH_SIZE", 10)?;
//!     tracing::info!(batch_size, "Configured");
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ConfigError, ConfigResult};
