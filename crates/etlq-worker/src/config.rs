//! Configuration management
//!
//! Read once at startup from the environment (after loading `.env`) and
//! immutable for the rest of the process.

use std::time::Duration;

use etlq_common::env::{var_list, var_or};
use etlq_common::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

use crate::db::DbConfig;
use crate::transfer::BackoffPolicy;

// ============================================================================
// ETL Configuration Constants
// ============================================================================

/// Default number of source rows per batch.
pub const DEFAULT_BATCH_SIZE: u32 = 10;

/// Default startup delay per cluster id, in seconds.
pub const DEFAULT_STAGGER_SECS: u64 = 1;

/// Default number of retries after a failed I/O step.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Default linger window after the first drain (0 = drain once).
pub const DEFAULT_LINGER_SECS: u64 = 0;

/// Default pause between drains inside the linger window.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;

/// Default lease on the per-pair population lock (0 = no lock).
pub const DEFAULT_POPULATE_LOCK_TTL_SECS: u64 = 300;

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub etl: EtlConfig,
    pub database: DbConfig,
}

/// Settings that shape how this process moves data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlConfig {
    pub batch_size: u32,
    pub modules: Vec<String>,
    /// This process's cluster member id
    pub cluster_id: u32,
    /// Number of cluster members; 0 disables partitioning
    pub cluster_size: u32,
    pub stagger_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub linger_secs: u64,
    pub poll_interval_secs: u64,
    pub populate_lock_ttl_secs: u64,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            modules: Vec::new(),
            cluster_id: 0,
            cluster_size: 0,
            stagger_secs: DEFAULT_STAGGER_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            linger_secs: DEFAULT_LINGER_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            populate_lock_ttl_secs: DEFAULT_POPULATE_LOCK_TTL_SECS,
        }
    }
}

impl EtlConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();

        Ok(Self {
            batch_size: var_or("ETL_BATCH_SIZE", defaults.batch_size)?,
            modules: var_list("ETL_MODULES"),
            cluster_id: var_or("NODE_APP_INSTANCE", defaults.cluster_id)?,
            cluster_size: var_or("CLUSTER_SIZE", defaults.cluster_size)?,
            stagger_secs: var_or("ETL_STAGGER_SECS", defaults.stagger_secs)?,
            max_retries: var_or("ETL_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_ms: var_or("ETL_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            linger_secs: var_or("ETL_LINGER_SECS", defaults.linger_secs)?,
            poll_interval_secs: var_or("ETL_POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            populate_lock_ttl_secs: var_or(
                "ETL_POPULATE_LOCK_TTL_SECS",
                defaults.populate_lock_ttl_secs,
            )?,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_delay_ms))
    }

    pub fn is_partitioned(&self) -> bool {
        self.cluster_size > 0
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::validation("ETL_BATCH_SIZE must be greater than 0"));
        }

        if i32::try_from(self.batch_size).is_err() {
            return Err(ConfigError::validation("ETL_BATCH_SIZE does not fit the queue table"));
        }

        if self.is_partitioned() && self.cluster_id >= self.cluster_size {
            return Err(ConfigError::validation(format!(
                "NODE_APP_INSTANCE ({}) must be less than CLUSTER_SIZE ({})",
                self.cluster_id, self.cluster_size
            )));
        }

        if !self.is_partitioned() && self.cluster_id != 0 {
            return Err(ConfigError::validation(format!(
                "NODE_APP_INSTANCE is {} but CLUSTER_SIZE is 0; only member 0 has work",
                self.cluster_id
            )));
        }

        if self.linger_secs > 0 && self.poll_interval_secs == 0 {
            return Err(ConfigError::validation(
                "ETL_POLL_INTERVAL_SECS must be greater than 0 when ETL_LINGER_SECS is set",
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> ConfigResult<Self> {
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration without validating it, so callers can apply overrides first
    pub fn from_env() -> ConfigResult<Self> {
        dotenvy::dotenv().ok();

        Ok(Config {
            etl: EtlConfig::from_env()?,
            database: DbConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.etl.validate()?;

        if self.database.url.is_empty() {
            return Err(ConfigError::validation("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::validation("DB_MAX_CONNECTIONS must be greater than 0"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::validation(
                "DB_MIN_CONNECTIONS cannot exceed DB_MAX_CONNECTIONS",
            ));
        }

        Ok(())
    }
}
