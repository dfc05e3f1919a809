//! Command-line interface of the `etlq` binary

use clap::{Parser, Subcommand};

use crate::config::EtlConfig;

#[derive(Parser, Debug)]
#[command(name = "etlq")]
#[command(author, version, about = "Batch ETL worker driven by a shared work queue", long_about = None)]
pub struct Cli {
    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Comma-separated modules to run, overrides ETL_MODULES
    #[arg(short, long, global = true, value_delimiter = ',')]
    pub modules: Option<Vec<String>>,

    /// Cluster member id of this process, overrides NODE_APP_INSTANCE
    #[arg(long, global = true)]
    pub cluster_id: Option<u32>,

    /// Number of cluster members, overrides CLUSTER_SIZE
    #[arg(long, global = true)]
    pub cluster_size: Option<u32>,

    /// Source rows per batch, overrides ETL_BATCH_SIZE
    #[arg(short, long, global = true)]
    pub batch_size: Option<u32>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Populate the queue (member 0) and process this member's batches
    Run,

    /// Only populate the queue, regardless of cluster id
    Populate,

    /// Show queue progress per module
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Move FAILED batches back to WAITING
    RetryFailed {
        /// Also release RUNNING batches left by a crashed worker; stop every worker first
        #[arg(long)]
        include_running: bool,
    },

    /// Delete all destination rows and queue items of the configured modules
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Apply command-line overrides on top of the environment configuration
    pub fn apply(&self, config: &mut EtlConfig) {
        if let Some(modules) = &self.modules {
            config.modules = modules
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }
        if let Some(cluster_id) = self.cluster_id {
            config.cluster_id = cluster_id;
        }
        if let Some(cluster_size) = self.cluster_size {
            config.cluster_size = cluster_size;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
    }
}
