//! Process driver: one transfer engine per configured module, fanned out in parallel

use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info};

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::queue::{DrainReport, QueueProgress};
use crate::registry::{ModuleRegistry, ResolvedModule};
use crate::store::Stores;
use crate::transfer::{EngineSettings, PopulateReport, TransferEngine};

/// How one module's run ended
#[derive(Debug)]
pub struct ModuleReport {
    pub name: String,
    /// Population result on member 0; `None` when skipped or not the populator
    pub populated: Option<PopulateReport>,
    pub outcome: EtlResult<DrainReport>,
}

/// Outcome of a full run across every configured module
#[derive(Debug, Default)]
pub struct RunReport {
    pub modules: Vec<ModuleReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.modules.iter().all(|m| m.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &EtlError)> {
        self.modules
            .iter()
            .filter_map(|m| m.outcome.as_ref().err().map(|e| (m.name.as_str(), e)))
    }

    /// Batches completed and failed across all modules that finished
    pub fn totals(&self) -> DrainReport {
        let mut total = DrainReport::default();
        for report in self.modules.iter().filter_map(|m| m.outcome.as_ref().ok()) {
            total += *report;
        }
        total
    }
}

/// Queue state of one module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleProgress {
    pub name: String,
    pub source_table: String,
    pub destination_table: String,
    pub progress: QueueProgress,
}

/// Rows removed by a reset of one module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub destination_rows: u64,
    pub queue_items: u64,
}

pub struct Driver {
    engines: Vec<(String, TransferEngine)>,
    stores: Stores,
    settings: EngineSettings,
}

impl Driver {
    pub fn new(modules: Vec<ResolvedModule>, stores: Stores, settings: EngineSettings) -> Self {
        let engines = modules
            .into_iter()
            .map(|module| {
                let engine = TransferEngine::new(module.spec, &stores, settings.clone());
                (module.name, engine)
            })
            .collect();

        Self {
            engines,
            stores,
            settings,
        }
    }

    /// Resolve the configured modules and build their engines
    pub fn from_config(
        config: &EtlConfig,
        registry: &ModuleRegistry,
        stores: Stores,
    ) -> EtlResult<Self> {
        let modules = registry.resolve(&config.modules)?;
        let settings = EngineSettings::from_config(config)?;
        Ok(Self::new(modules, stores, settings))
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.engines.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn engine(&self, name: &str) -> Option<&TransferEngine> {
        self.engines
            .iter()
            .find(|(module, _)| module == name)
            .map(|(_, engine)| engine)
    }

    /// Populate every module in parallel, each under its population lock
    pub async fn populate_all(&self) -> Vec<(String, EtlResult<Option<PopulateReport>>)> {
        let results = join_all(self.engines.iter().map(|(_, engine)| engine.populate_guarded())).await;

        self.engines
            .iter()
            .zip(results)
            .map(|((name, _), result)| {
                if let Err(err) = &result {
                    error!(module = %name, error = %err, "Population failed");
                }
                (name.clone(), result)
            })
            .collect()
    }

    /// Populate (member 0 only), then drain every module in parallel
    ///
    /// A module whose population failed is not drained. Failures never stop
    /// the other modules; they are collected in the report.
    pub async fn run(&self) -> RunReport {
        let cluster_id = self.settings.cluster_id;
        info!(
            cluster_id,
            modules = ?self.module_names(),
            "Starting ETL run on cluster #{}",
            cluster_id
        );

        let mut populated: Vec<Option<EtlResult<Option<PopulateReport>>>> =
            self.engines.iter().map(|_| None).collect();

        if self.settings.is_populator() {
            for (slot, (_, result)) in populated.iter_mut().zip(self.populate_all().await) {
                *slot = Some(result);
            }
            info!("Queue population finished, starting workers");
        }

        let runs = self
            .engines
            .iter()
            .zip(populated)
            .map(|((name, engine), population)| async move {
                let (populated, outcome) = match population {
                    Some(Err(err)) => (None, Err(err)),
                    Some(Ok(report)) => (report, engine.process().await),
                    None => (None, engine.process().await),
                };

                match &outcome {
                    Ok(report) => info!(
                        module = %name,
                        completed = report.completed,
                        failed = report.failed,
                        "Module finished"
                    ),
                    Err(err) => error!(module = %name, error = %err, "Module stopped"),
                }

                ModuleReport {
                    name: name.clone(),
                    populated,
                    outcome,
                }
            });

        RunReport {
            modules: join_all(runs).await,
        }
    }

    pub async fn progress(&self) -> EtlResult<Vec<ModuleProgress>> {
        let mut all = Vec::with_capacity(self.engines.len());
        for (name, engine) in &self.engines {
            let pair = engine.pair();
            all.push(ModuleProgress {
                name: name.clone(),
                source_table: pair.source_table.clone(),
                destination_table: pair.destination_table.clone(),
                progress: engine.queue().progress().await?,
            });
        }
        Ok(all)
    }

    /// Send FAILED items of every module back to WAITING
    pub async fn requeue_failed(&self) -> EtlResult<Vec<(String, u64)>> {
        let mut moved = Vec::with_capacity(self.engines.len());
        for (name, engine) in &self.engines {
            let count = engine.queue().requeue_failed().await?;
            info!(module = %name, requeued = count, "Requeued failed batches");
            moved.push((name.clone(), count));
        }
        Ok(moved)
    }

    /// Send RUNNING items of every module back to WAITING
    ///
    /// For batches orphaned by a crashed worker; run it only while no worker is active.
    pub async fn requeue_running(&self) -> EtlResult<Vec<(String, u64)>> {
        let mut moved = Vec::with_capacity(self.engines.len());
        for (name, engine) in &self.engines {
            let count = engine.queue().requeue_running().await?;
            info!(module = %name, requeued = count, "Requeued running batches");
            moved.push((name.clone(), count));
        }
        Ok(moved)
    }

    /// Delete destination rows and queue items of every module
    pub async fn reset(&self) -> EtlResult<Vec<(String, ResetReport)>> {
        let mut reports = Vec::with_capacity(self.engines.len());
        for (name, engine) in &self.engines {
            let destination_rows = self
                .stores
                .destination
                .clear_table(&engine.spec().destination_table)
                .await?;
            let queue_items = engine.queue().clear().await?;

            info!(
                module = %name,
                destination_rows,
                queue_items,
                "Reset state of {}",
                engine.pair()
            );
            reports.push((
                name.clone(),
                ResetReport {
                    destination_rows,
                    queue_items,
                },
            ));
        }
        Ok(reports)
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("modules", &self.module_names())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::modules::{customers, orders};
    use crate::queue::QueueStatus;
    use crate::store::memory::{MemoryStore, Operation};
    use crate::transfer::{BackoffPolicy, Row};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(cluster_id: u32, cluster_size: u32) -> EtlConfig {
        EtlConfig {
            modules: vec!["customers".into(), "orders".into()],
            cluster_id,
            cluster_size,
            stagger_secs: 0,
            max_retries: 1,
            retry_base_delay_ms: 5,
            ..EtlConfig::default()
        }
    }

    fn seed(store: &MemoryStore) {
        store.insert_rows(
            customers::SOURCE_TABLE,
            (1..=12).map(|id| {
                Row::new()
                    .with("id", id as i64)
                    .with("FullName", format!("Customer {id}"))
                    .with("Email", format!("C{id}@EXAMPLE.com"))
            }),
        );
        store.insert_rows(
            orders::SOURCE_TABLE,
            (1..=4).map(|id| {
                Row::new()
                    .with("id", id as i64)
                    .with("CustomerId", 1i64)
                    .with("Quantity", 2i64)
                    .with("UnitPrice", 5.0)
                    .with("Status", if id == 2 { "X" } else { "N" })
            }),
        );
    }

    fn driver(store: &Arc<MemoryStore>, config: &EtlConfig) -> Driver {
        Driver::from_config(config, &ModuleRegistry::builtin(), Stores::memory(store.clone()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_moves_every_module() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);

        let report = driver(&store, &config(0, 0)).run().await;

        assert!(report.is_success());
        assert_eq!(report.totals(), DrainReport { completed: 3, failed: 0 });
        assert_eq!(store.rows(customers::DESTINATION_TABLE).len(), 12);
        assert_eq!(store.rows(orders::DESTINATION_TABLE).len(), 3);

        let customers_report = &report.modules[0];
        assert_eq!(customers_report.name, "customers");
        assert_eq!(customers_report.populated.unwrap().batches, 2);
    }

    #[tokio::test]
    async fn test_unknown_module_fails_before_any_work() {
        let store = Arc::new(MemoryStore::new());
        let config = EtlConfig {
            modules: vec!["customers".into(), "nope".into()],
            ..config(0, 0)
        };

        let err = Driver::from_config(&config, &ModuleRegistry::builtin(), Stores::memory(store.clone()))
            .unwrap_err();

        assert!(matches!(err, EtlError::UnknownModule { .. }));
        assert_eq!(store.calls(Operation::SourceIds), 0);
    }

    #[tokio::test]
    async fn test_non_zero_member_only_drains() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);

        let report = driver(&store, &config(1, 2)).run().await;

        assert!(report.is_success());
        assert!(report.modules.iter().all(|m| m.populated.is_none()));
        assert_eq!(store.calls(Operation::SourceIds), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_module_does_not_stop_the_others() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        store.reject_id(orders::DESTINATION_TABLE, 3);

        let report = driver(&store, &config(0, 0)).run().await;

        assert!(!report.is_success());
        let failures: Vec<&str> = report.failures().map(|(name, _)| name).collect();
        assert_eq!(failures, vec!["orders"]);
        assert_eq!(store.rows(customers::DESTINATION_TABLE).len(), 12);

        let failed = store
            .queue_items()
            .into_iter()
            .find(|i| i.source_table == orders::SOURCE_TABLE)
            .unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_population_failure_skips_draining_that_module() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        // Two attempts per module: both first attempts and one retry fail
        store.fail_next(Operation::SourceIds, 3);

        let driver = driver(&store, &config(0, 0));
        let report = driver.run().await;

        assert_eq!(report.failures().count(), 1);
        let failed = report.modules.iter().find(|m| m.outcome.is_err()).unwrap();
        assert!(failed.populated.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_failed_moves_items_back_to_waiting() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        store.reject_id(orders::DESTINATION_TABLE, 3);
        let driver = driver(&store, &config(0, 0));
        assert!(!driver.run().await.is_success());

        let moved = driver.requeue_failed().await.unwrap();
        assert_eq!(moved, vec![("customers".to_string(), 0), ("orders".to_string(), 1)]);

        let progress = driver.progress().await.unwrap();
        assert_eq!(progress[1].progress.waiting, 1);
        assert_eq!(progress[0].progress.completed, 2);
    }

    #[tokio::test]
    async fn test_requeue_running_recovers_orphaned_batches() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let driver = driver(&store, &config(0, 0));
        driver.populate_all().await;

        // A worker claimed a batch and died before recording the outcome
        let queue = driver.engine("customers").unwrap().queue();
        let orphan = queue.claim_next(0).await.unwrap().unwrap();

        let moved = driver.requeue_running().await.unwrap();
        assert_eq!(moved, vec![("customers".to_string(), 1), ("orders".to_string(), 0)]);
        assert_eq!(store.queue_item(orphan.id).unwrap().status, QueueStatus::Waiting);

        let report = driver.run().await;
        assert!(report.is_success());
        assert_eq!(store.rows(customers::DESTINATION_TABLE).len(), 12);
    }

    #[tokio::test]
    async fn test_reset_clears_destination_and_queue() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let driver = driver(&store, &config(0, 0));
        assert!(driver.run().await.is_success());

        let reports = driver.reset().await.unwrap();

        assert_eq!(reports[0].1, ResetReport { destination_rows: 12, queue_items: 2 });
        assert_eq!(reports[1].1, ResetReport { destination_rows: 3, queue_items: 1 });
        assert!(store.queue_items().is_empty());
        assert_eq!(store.rows(customers::SOURCE_TABLE).len(), 12);
    }

    #[test]
    fn test_settings_come_from_config() {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(&store, &config(0, 0));
        let engine = driver.engine("orders").unwrap();

        assert_eq!(
            engine.settings().backoff,
            BackoffPolicy::new(1, Duration::from_millis(5))
        );
        assert_eq!(driver.module_names(), vec!["customers", "orders"]);
    }
}
