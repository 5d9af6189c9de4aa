//! Migration orchestrator - main workflow coordinator.
//!
//! A run resolves the catalog, replicates every included table (phase 1),
//! waits for all of them, then rewrites foreign keys table by table
//! (phase 2). Both phases fan out one task per table, bounded by `workers`.

mod report;

pub use report::{
    HealthCheckResult, MigrationPlan, MigrationReport, TableReport, TableValidation,
};

use crate::config::{Config, TargetMode};
use crate::core::{
    CatalogReader, IdentifierAllocator, RandomIdAllocator, RemapStore, SourceStore, TablePlan,
    TargetStore,
};
use crate::error::{MigrateError, Result};
use crate::memory::{MemorySource, MemoryTarget};
use crate::remap::{ForeignKeyRemapper, RemapResult};
use crate::replicate::{ReplicationResult, TableReplicator};
use crate::source::MssqlPool;
use crate::state::{MigrationState, RunStatus, TableStatus};
use crate::target::MongoTarget;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The stores a run talks to.
#[derive(Clone)]
pub struct Backends {
    pub catalog: Arc<dyn CatalogReader>,
    pub source: Arc<dyn SourceStore>,
    pub target: Arc<dyn TargetStore>,
    pub remap: Arc<dyn RemapStore>,
    pub allocator: Arc<dyn IdentifierAllocator>,
}

impl Backends {
    /// Connect to SQL Server and MongoDB as configured.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool_size = config.migration.get_max_mssql_connections() as u32;
        let source = Arc::new(MssqlPool::with_max_connections(config.source.clone(), pool_size).await?);
        let target =
            Arc::new(MongoTarget::connect(&config.target, &config.migration.remap_suffix).await?);

        Ok(Self {
            catalog: source.clone(),
            source,
            target: target.clone(),
            remap: target,
            allocator: Arc::new(RandomIdAllocator),
        })
    }

    /// In-memory stores.
    pub fn memory(source: Arc<MemorySource>, target: Arc<MemoryTarget>) -> Self {
        Self {
            catalog: source.clone(),
            source,
            target: target.clone(),
            remap: target,
            allocator: Arc::new(RandomIdAllocator),
        }
    }

    /// Replace the identifier allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn IdentifierAllocator>) -> Self {
        self.allocator = allocator;
        self
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    backends: Backends,
    state_file: Option<PathBuf>,
    state: Option<MigrationState>,
}

impl Orchestrator {
    /// Create a new orchestrator connected to the configured databases.
    pub async fn new(config: Config) -> Result<Self> {
        let backends = Backends::connect(&config).await?;
        Ok(Self::with_backends(config, backends))
    }

    /// Create an orchestrator over already constructed stores.
    pub fn with_backends(config: Config, backends: Backends) -> Self {
        Self {
            config,
            backends,
            state_file: None,
            state: None,
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = MigrationState::load(path)?;
                state.validate_config(&self.config.hash())?;
                self.state = Some(state);
                info!("Resuming from state file: {:?}", path);
            }
        }
        Ok(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve tables, keys and foreign keys without moving data.
    pub async fn plan(&self) -> Result<MigrationPlan> {
        let skip = self.config.migration.skip_set();
        let names = self.backends.catalog.list_tables(&skip).await?;

        let mut tables = Vec::with_capacity(names.len());
        for name in &names {
            let table = self.backends.catalog.plan_table(name).await?;
            debug!(
                "{}: pk={:?}, {} foreign keys",
                name,
                table.primary_key,
                table.foreign_keys.len()
            );
            tables.push(table);
        }

        let warnings = plan_warnings(&tables, &skip);

        let mut skipped: Vec<String> = skip.into_iter().collect();
        skipped.sort();

        info!(
            "Plan: {} tables, {} skipped, {} warnings",
            tables.len(),
            skipped.len(),
            warnings.len()
        );

        Ok(MigrationPlan {
            tables,
            skipped,
            warnings,
        })
    }

    /// Run the migration.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<MigrationReport> {
        let started_at = Utc::now();

        let plan = self.plan().await?;
        for warning in &plan.warnings {
            warn!("{}", warning);
        }

        let mut state = match self.state.take() {
            Some(mut state) => {
                let retried = state.retry_failed();
                for table in &retried {
                    info!("{}: retrying failed replication", table);
                }
                for table in state.reopen_referencing(&retried, &plan.tables)? {
                    info!("{}: references a retried table, remapping again", table);
                }
                state.status = RunStatus::Running;
                state.completed_at = None;
                state
            }
            None => MigrationState::new(uuid::Uuid::new_v4().to_string(), self.config.hash()),
        };
        info!("Starting migration run: {}", state.run_id);

        let mut reports = BTreeMap::new();
        for table in &plan.tables {
            let table_state = state.get_or_create_table(&table.name);
            let mut report = TableReport::new(&table.name, table.has_pk());
            report.status = table_state.status;
            report.rows_replicated = table_state.rows_replicated;
            report.remap_entries = table_state.remap_entries;
            report.records_remapped = table_state.records_remapped;
            report.fields_remapped = table_state.fields_remapped;
            report.dangling = table_state.dangling.clone();
            reports.insert(table.name.clone(), report);
        }
        self.save_state(&mut state)?;

        self.write_primary_key_audit().await?;

        info!("Phase 1: replicating tables");
        self.replicate_phase(&plan, &mut state, &mut reports, &cancel)
            .await?;

        // Barrier: every replication task has been joined at this point.
        let remap_failures = if cancel.is_cancelled() {
            warn!("Cancellation requested, skipping foreign key remap");
            Vec::new()
        } else {
            info!("Phase 2: remapping foreign keys");
            self.remap_phase(&plan, &mut state, &mut reports, &cancel)
                .await?
        };

        let tables: Vec<TableReport> = reports.into_values().collect();
        let failed_tables: Vec<String> = tables
            .iter()
            .filter(|t| t.status == TableStatus::ReplicationFailed)
            .map(|t| t.table.clone())
            .collect();

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if !failed_tables.is_empty() || !remap_failures.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        state.finish(status);
        self.save_state(&mut state)?;

        let completed_at = Utc::now();
        let report = MigrationReport {
            run_id: state.run_id.clone(),
            status,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            tables_total: tables.len(),
            tables_remapped: tables
                .iter()
                .filter(|t| t.status == TableStatus::Remapped)
                .count(),
            tables_failed: failed_tables.len(),
            rows_replicated: tables.iter().map(|t| t.rows_replicated).sum(),
            remap_entries: tables.iter().map(|t| t.remap_entries).sum(),
            fields_remapped: tables.iter().map(|t| t.fields_remapped).sum(),
            dangling_references: tables.iter().map(|t| t.dangling.len()).sum(),
            failed_tables,
            remap_failures,
            warnings: plan.warnings,
            tables,
        };

        info!(
            "Migration {:?}: {} tables, {} rows, {} fields remapped, {} dangling references in {:.1}s",
            report.status,
            report.tables_total,
            report.rows_replicated,
            report.fields_remapped,
            report.dangling_references,
            report.duration_seconds
        );
        if !report.failed_tables.is_empty() {
            error!("Tables failed to replicate: {:?}", report.failed_tables);
        }

        Ok(report)
    }

    /// Persist the raw primary-key catalog rows of the included tables.
    async fn write_primary_key_audit(&self) -> Result<()> {
        let skip = self.config.migration.skip_set();
        let collection = &self.config.migration.primary_keys_collection;

        let rows = self.backends.catalog.primary_key_rows().await?;
        let documents = rows
            .iter()
            .filter(|row| !skip.contains(&row.table_name))
            .map(|row| {
                mongodb::bson::to_document(row).map_err(|e| MigrateError::Conversion(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Writing {} primary key catalog rows to {}",
            documents.len(),
            collection
        );
        self.backends.target.replace_audit(collection, documents).await
    }

    /// Phase 1: replicate every pending table.
    async fn replicate_phase(
        &self,
        plan: &MigrationPlan,
        state: &mut MigrationState,
        reports: &mut BTreeMap<String, TableReport>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let workers = self.config.migration.get_workers().max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mode = self.config.migration.target_mode;
        let timeout = self.table_timeout();

        let replicator = Arc::new(TableReplicator::new(
            self.backends.source.clone(),
            self.backends.target.clone(),
            self.backends.remap.clone(),
            self.backends.allocator.clone(),
        ));

        let pending: Vec<&TablePlan> = plan
            .tables
            .iter()
            .filter(|t| state.table_status(&t.name) == TableStatus::Pending)
            .collect();

        info!(
            "Replicating {} tables with {} workers ({} already replicated)",
            pending.len(),
            workers,
            plan.tables.len() - pending.len()
        );

        let mut handles: Vec<(String, JoinHandle<Result<ReplicationResult>>)> =
            Vec::with_capacity(pending.len());

        for table in pending {
            let name = table.name.clone();
            let primary_key = table.primary_key.clone();
            let semaphore = semaphore.clone();
            let replicator = replicator.clone();
            let target = self.backends.target.clone();
            let remap = self.backends.remap.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MigrateError::Cancelled)?;

                guarded(&name, &cancel, timeout, async {
                    if mode == TargetMode::DropRecreate {
                        target.drop_collection(&name).await?;
                        remap.clear(&name).await?;
                    }
                    replicator.replicate(&name, primary_key.as_deref()).await
                })
                .await
            });

            handles.push((table.name.clone(), handle));
        }

        for (name, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(MigrateError::replication(&name, format!("task panicked: {}", e)))
            });

            let table_state = state.get_or_create_table(&name);
            let report = reports
                .entry(name.clone())
                .or_insert_with(|| TableReport::new(&name, false));

            match outcome {
                Ok(result) => {
                    table_state.mark_replicated(result.rows, result.remap_entries)?;
                    report.status = TableStatus::Replicated;
                    report.rows_replicated = result.rows;
                    report.remap_entries = result.remap_entries;
                }
                Err(e) => {
                    error!("{}: replication failed: {}", name, e);
                    // Entries of a partial replication must not resolve references.
                    if let Err(clear) = self.backends.remap.clear(&name).await {
                        warn!("{}: could not clear remap entries: {}", name, clear);
                    }
                    table_state.mark_failed(&e.to_string())?;
                    report.status = TableStatus::ReplicationFailed;
                    report.error = Some(e.to_string());
                }
            }

            self.save_state(state)?;
        }

        Ok(())
    }

    /// Phase 2: remap every replicated table. Returns the tables whose remap failed.
    async fn remap_phase(
        &self,
        plan: &MigrationPlan,
        state: &mut MigrationState,
        reports: &mut BTreeMap<String, TableReport>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let workers = self.config.migration.get_workers().max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let timeout = self.table_timeout();

        let remapper = Arc::new(ForeignKeyRemapper::new(
            self.backends.target.clone(),
            self.backends.remap.clone(),
        ));

        let ready: Vec<&TablePlan> = plan
            .tables
            .iter()
            .filter(|t| state.table_status(&t.name) == TableStatus::Replicated)
            .collect();

        // Only tables that completed phase 1 can resolve references.
        let replicated: Arc<HashSet<String>> = Arc::new(
            plan.tables
                .iter()
                .filter(|t| {
                    matches!(
                        state.table_status(&t.name),
                        TableStatus::Replicated | TableStatus::Remapped
                    )
                })
                .map(|t| t.name.clone())
                .collect(),
        );

        info!("Remapping {} tables with {} workers", ready.len(), workers);

        let mut handles: Vec<(String, JoinHandle<Result<RemapResult>>)> =
            Vec::with_capacity(ready.len());

        for table in ready {
            let name = table.name.clone();
            let foreign_keys = table.foreign_keys.clone();
            let semaphore = semaphore.clone();
            let remapper = remapper.clone();
            let replicated = replicated.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MigrateError::Cancelled)?;

                let remap = remapper.remap(&name, &foreign_keys, &replicated);
                guarded(&name, &cancel, timeout, remap).await
            });

            handles.push((table.name.clone(), handle));
        }

        let mut failures = Vec::new();
        for (name, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(MigrateError::replication(&name, format!("task panicked: {}", e)))
            });

            let report = reports
                .entry(name.clone())
                .or_insert_with(|| TableReport::new(&name, false));

            match outcome {
                Ok(result) => {
                    state.get_or_create_table(&name).mark_remapped(&result)?;
                    report.status = TableStatus::Remapped;
                    report.records_remapped = result.records_updated;
                    report.fields_remapped = result.fields_remapped;
                    report.already_remapped = result.already_remapped;
                    report.dangling = result.dangling;
                }
                Err(e) => {
                    error!("{}: remap failed: {}", name, e);
                    report.error = Some(e.to_string());
                    failures.push(name);
                }
            }

            self.save_state(state)?;
        }

        Ok(failures)
    }

    /// Compare source rows, target records and remap entries per table.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let plan = self.plan().await?;
        let mut results = Vec::with_capacity(plan.tables.len());

        for table in &plan.tables {
            let source_rows = self.backends.source.row_count(&table.name).await?;
            let target_records = self.backends.target.count(&table.name).await.unwrap_or(0);
            let remap_entries = self
                .backends
                .remap
                .entry_count(&table.name)
                .await
                .unwrap_or(0);

            let rows_match = u64::try_from(source_rows).ok() == Some(target_records);
            let entries_match = !table.has_pk() || remap_entries == target_records;
            let matches = rows_match && entries_match;

            if matches {
                info!("{}: {} rows (match)", table.name, source_rows);
            } else {
                warn!(
                    "{}: source={} target={} remap={} (MISMATCH)",
                    table.name, source_rows, target_records, remap_entries
                );
            }

            results.push(TableValidation {
                table: table.name.clone(),
                source_rows,
                target_records,
                remap_entries,
                has_primary_key: table.has_pk(),
                matches,
            });
        }

        Ok(results)
    }

    /// Ping both stores.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.backends.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.backends.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        let healthy = source.is_ok() && target.is_ok();
        Ok(HealthCheckResult {
            source_type: self.backends.source.db_type().to_string(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_type: self.backends.target.db_type().to_string(),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
            healthy,
        })
    }

    fn table_timeout(&self) -> Option<Duration> {
        self.config.migration.table_timeout_secs.map(Duration::from_secs)
    }

    /// Save state to file.
    fn save_state(&self, state: &mut MigrationState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}

/// Warnings for references that cannot be restored.
fn plan_warnings(tables: &[TablePlan], skip: &HashSet<String>) -> Vec<String> {
    let in_run: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let keyed: HashSet<&str> = tables
        .iter()
        .filter(|t| t.has_pk())
        .map(|t| t.name.as_str())
        .collect();

    let mut warnings = Vec::new();
    for table in tables {
        if !table.has_pk() {
            warnings.push(format!(
                "{}: no primary key; its records cannot be referenced after migration",
                table.name
            ));
        }

        for fk in &table.foreign_keys {
            let referenced = fk.referenced_table.as_str();
            let problem = if skip.contains(referenced) {
                "is skipped"
            } else if !in_run.contains(referenced) {
                "is not part of the run"
            } else if !keyed.contains(referenced) {
                "has no primary key"
            } else {
                continue;
            };
            warnings.push(format!(
                "{}.{}: referenced table {} {}; values will stay dangling",
                table.name, fk.source_column, referenced, problem
            ));
        }
    }
    warnings
}

/// Run one table's work under the cancellation token and the per-table time limit.
async fn guarded<T, F>(
    table: &str,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let limited = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
                Err(MigrateError::replication(
                    table,
                    format!("timed out after {}s", limit.as_secs()),
                ))
            }),
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        result = limited => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ForeignKeyDescriptor;

    fn table(name: &str, pk: bool, fks: &[(&str, &str)]) -> TablePlan {
        TablePlan {
            name: name.to_string(),
            primary_key: pk.then(|| vec!["Id".to_string()]),
            foreign_keys: fks
                .iter()
                .map(|(col, referenced)| ForeignKeyDescriptor::new(*col, *referenced))
                .collect(),
        }
    }

    #[test]
    fn test_plan_warnings() {
        let tables = vec![
            table("dbo.Person", true, &[]),
            table("dbo.Log", false, &[]),
            table(
                "dbo.Order",
                true,
                &[
                    ("PersonId", "dbo.Person"),
                    ("LogId", "dbo.Log"),
                    ("ShipperId", "dbo.Shipper"),
                    ("RegionId", "dbo.Region"),
                ],
            ),
        ];
        let skip: HashSet<String> = ["dbo.Region".to_string()].into_iter().collect();

        let warnings = plan_warnings(&tables, &skip);
        assert_eq!(warnings.len(), 4);
        assert!(warnings[0].starts_with("dbo.Log: no primary key"));
        assert!(warnings.iter().any(|w| w.contains("dbo.Log has no primary key")));
        assert!(warnings.iter().any(|w| w.contains("dbo.Shipper is not part of the run")));
        assert!(warnings.iter().any(|w| w.contains("dbo.Region is skipped")));
        assert!(!warnings.iter().any(|w| w.contains("dbo.Person")));
    }

    #[tokio::test]
    async fn test_guarded_timeout() {
        let cancel = CancellationToken::new();
        let result: Result<()> = guarded(
            "dbo.Slow",
            &cancel,
            Some(Duration::from_millis(10)),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(MigrateError::Replication { .. })));
    }

    #[tokio::test]
    async fn test_guarded_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = guarded("dbo.Any", &cancel, None, std::future::pending()).await;
        assert!(matches!(result, Err(MigrateError::Cancelled)));
    }
}
