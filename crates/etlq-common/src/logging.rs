//! Logging Configuration and Initialization
//!
//! One tracing subscriber for every ETLQ process. It supports:
//!
//! - Console, file, or both as output targets
//! - Text or JSON formatting
//! - Daily rotating log files
//! - A dedicated SQL statement log
//!
//! # SQL statement log
//!
//! Store adapters log every statement they issue at `DEBUG` under the
//! [`SQL_TARGET`] target. With file output and `sql_file` enabled those events
//! are written to their own `<prefix>_sql` file and kept out of the console
//! and the combined log. Otherwise they follow the normal level filter.
//!
//! # Usage
//!
//! Use the structured macros with fields rather than `println!`:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! let (source_table, cluster_id) = ("legacy_customers", 0);
//! info!(source_table, cluster_id, "Populating queue");
//! warn!(source_table, "No new records to process");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use etlq_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     // The guard flushes file writers on drop; keep it for the process lifetime
//!     let _guard = init_logging(&config)?;
//!
//!     info!("Worker started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::filter_fn,
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::env;
use crate::error::{ConfigError, ConfigResult};

/// Tracing target used for SQL statement events
pub const SQL_TARGET: &str = "etlq::sql";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("expected trace, debug, info, warn or error, got '{}'", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Output target for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn writes_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn writes_files(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl std::str::FromStr for LogOutput {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(format!("expected console, file or both, got '{}'", s)),
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("expected text or json, got '{}'", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,

    /// Output target (console, file, or both)
    pub output: LogOutput,

    /// Log format (text or JSON)
    pub format: LogFormat,

    /// Directory for log files (only used when output includes file)
    pub log_dir: PathBuf,

    /// Log file name prefix ("etl" -> "etl.2024-01-18", "etl_sql.2024-01-18")
    pub log_file_prefix: String,

    /// Route SQL statement events to their own file
    pub sql_file: bool,

    /// Additional filter directives (e.g., "sqlx=warn,etlq_worker=debug")
    pub filter_directives: Option<String>,

    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "etl".to_string(),
            sql_file: true,
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// - `LOG_LEVEL`: trace, debug, info, warn, error
    /// - `LOG_OUTPUT`: console, file, both
    /// - `LOG_FORMAT`: text, json
    /// - `LOG_DIR`: directory for log files
    /// - `LOG_FILE_PREFIX`: prefix for log files
    /// - `LOG_SQL_FILE`: separate SQL statement log (true/false)
    /// - `LOG_FILTER`: additional filter directives
    /// - `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS`, `LOG_INCLUDE_TARGETS`
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().merge_env()
    }

    /// Overlay environment variables on top of this configuration
    pub fn merge_env(self) -> ConfigResult<Self> {
        Ok(Self {
            level: env::var_or("LOG_LEVEL", self.level)?,
            output: env::var_or("LOG_OUTPUT", self.output)?,
            format: env::var_or("LOG_FORMAT", self.format)?,
            log_dir: env::var_opt("LOG_DIR").map(PathBuf::from).unwrap_or(self.log_dir),
            log_file_prefix: env::var_opt("LOG_FILE_PREFIX").unwrap_or(self.log_file_prefix),
            sql_file: env::var_or("LOG_SQL_FILE", self.sql_file)?,
            filter_directives: env::var_opt("LOG_FILTER").or(self.filter_directives),
            include_location: env::var_or("LOG_INCLUDE_LOCATION", self.include_location)?,
            include_thread_ids: env::var_or("LOG_INCLUDE_THREAD_IDS", self.include_thread_ids)?,
            include_targets: env::var_or("LOG_INCLUDE_TARGETS", self.include_targets)?,
        })
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn separate_sql_file(&self) -> bool {
        self.sql_file && self.output.writes_files()
    }

    fn sql_file_prefix(&self) -> String {
        format!("{}_sql", self.log_file_prefix)
    }

    fn env_filter(&self) -> ConfigResult<EnvFilter> {
        let mut filter =
            EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());

        if self.separate_sql_file() {
            let directive = format!("{}=debug", SQL_TARGET);
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| ConfigError::invalid("LOG_FILTER", &directive, format!("{}", e)))?,
            );
        }

        if let Some(ref directives) = self.filter_directives {
            for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                filter = filter.add_directive(
                    directive
                        .parse()
                        .map_err(|e| ConfigError::invalid("LOG_FILTER", directive, format!("{}", e)))?,
                );
            }
        }

        Ok(filter)
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn sql_file(mut self, enabled: bool) -> Self {
        self.config.sql_file = enabled;
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the non-blocking file writers alive; dropping it flushes them
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _workers: Vec<WorkerGuard>,
}

/// Initialize logging with the given configuration
///
/// Sets the global tracing subscriber, so it may only be called once per process.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = config.env_filter()?;
    let split_sql = config.separate_sql_file();

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut workers = Vec::new();

    if config.output.writes_console() {
        let console = fmt_layer(config, std::io::stdout, true);
        layers.push(if split_sql {
            console.with_filter(filter_fn(|meta| meta.target() != SQL_TARGET)).boxed()
        } else {
            console
        });
    }

    if config.output.writes_files() {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

        let combined = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (combined, guard) = tracing_appender::non_blocking(combined);
        workers.push(guard);

        let combined = fmt_layer(config, combined, false);
        layers.push(if split_sql {
            combined.with_filter(filter_fn(|meta| meta.target() != SQL_TARGET)).boxed()
        } else {
            combined
        });

        if split_sql {
            let sql = tracing_appender::rolling::daily(&config.log_dir, config.sql_file_prefix());
            let (sql, guard) = tracing_appender::non_blocking(sql);
            workers.push(guard);

            layers.push(
                fmt_layer(config, sql, false)
                    .with_filter(filter_fn(|meta| meta.target() == SQL_TARGET))
                    .boxed(),
            );
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _workers: workers })
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
