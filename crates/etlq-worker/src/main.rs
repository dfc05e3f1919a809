//! ETLQ Worker - Main entry point

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use etlq_common::logging::{init_logging, LogConfig};
use tracing::{error, info, warn};

use etlq_worker::cli::{Cli, Command};
use etlq_worker::config::Config;
use etlq_worker::db;
use etlq_worker::driver::Driver;
use etlq_worker::registry::ModuleRegistry;
use etlq_worker::store::Stores;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("etl")
        .filter_directives("etlq_worker=info,etlq=info,sqlx=warn")
        .build()
        // Environment variables take precedence
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = Config::from_env()?;
    cli.apply(&mut config.etl);
    config.validate()?;

    if config.etl.modules.is_empty() {
        warn!("No ETL modules configured (set ETL_MODULES), nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    // Unknown modules and invalid specs fail before touching the database
    let registry = ModuleRegistry::builtin();
    registry.resolve(&config.etl.modules)?;

    let pool = match db::create_pool(&config.database).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "Could not connect to the database");
            return Ok(ExitCode::FAILURE);
        }
    };
    db::health_check(&pool).await?;
    db::ensure_schema(&pool).await?;
    info!("Database ready");

    let driver = Driver::from_config(&config.etl, &registry, Stores::postgres(pool.clone()))?;
    let result = execute(&cli.command(), &driver).await;

    pool.close().await;

    match result {
        Ok(code) => Ok(code),
        Err(err) => {
            error!(error = %err, "Command failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn execute(command: &Command, driver: &Driver) -> Result<ExitCode> {
    match command {
        Command::Run => {
            let report = driver.run().await;
            let totals = report.totals();
            info!(
                completed = totals.completed,
                failed = totals.failed,
                "ETL run finished"
            );

            if report.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                for (module, err) in report.failures() {
                    error!(module, fatal = err.is_fatal(), error = %err, "Module failed");
                }
                Ok(ExitCode::FAILURE)
            }
        }

        Command::Populate => {
            let mut failed = false;
            for (module, result) in driver.populate_all().await {
                match result {
                    Ok(Some(report)) => info!(
                        module = %module,
                        batches = report.batches,
                        new_ids = report.new_ids,
                        "Queue populated"
                    ),
                    Ok(None) => info!(module = %module, "Population skipped, lock held elsewhere"),
                    Err(_) => failed = true,
                }
            }
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }

        Command::Status { json } => {
            let progress = driver.progress().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&progress)?);
            } else {
                println!(
                    "{:<16} {:>9} {:>9} {:>9} {:>9} {:>7}",
                    "MODULE", "WAITING", "RUNNING", "COMPLETED", "FAILED", "DONE"
                );
                for module in &progress {
                    let p = &module.progress;
                    println!(
                        "{:<16} {:>9} {:>9} {:>9} {:>9} {:>6.1}%",
                        module.name,
                        p.waiting,
                        p.running,
                        p.completed,
                        p.failed,
                        p.completion_percentage()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::RetryFailed { include_running } => {
            let moved: u64 = driver.requeue_failed().await?.iter().map(|(_, n)| n).sum();
            info!(requeued = moved, "Failed batches moved back to WAITING");

            if *include_running {
                let moved: u64 = driver.requeue_running().await?.iter().map(|(_, n)| n).sum();
                info!(requeued = moved, "Running batches moved back to WAITING");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Reset { yes } => {
            if !yes {
                eprintln!(
                    "Refusing to delete destination rows of {} without --yes",
                    driver.module_names().join(", ")
                );
                return Ok(ExitCode::FAILURE);
            }
            driver.reset().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
