//! Plans, reports and check results produced by the orchestrator.

use crate::core::TablePlan;
use crate::error::Result;
use crate::remap::DanglingReference;
use crate::state::{RunStatus, TableStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Catalog resolution for a run, without moving any data.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    /// Tables in the run, with keys and foreign keys.
    pub tables: Vec<TablePlan>,

    /// Tables left out by the skip-list, sorted.
    pub skipped: Vec<String>,

    /// Conditions that will leave references dangling or records unreferenceable.
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Look up a table of the run.
    pub fn table(&self, name: &str) -> Option<&TablePlan> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Per-table outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    pub has_primary_key: bool,
    pub rows_replicated: u64,
    pub remap_entries: u64,
    pub records_remapped: u64,
    pub fields_remapped: u64,
    pub already_remapped: u64,
    pub dangling: Vec<DanglingReference>,

    /// Replication or remap error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub(crate) fn new(table: &str, has_primary_key: bool) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Pending,
            has_primary_key,
            rows_replicated: 0,
            remap_entries: 0,
            records_remapped: 0,
            fields_remapped: 0,
            already_remapped: 0,
            dangling: Vec::new(),
            error: None,
        }
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub tables_remapped: usize,
    pub tables_failed: usize,
    pub rows_replicated: u64,
    pub remap_entries: u64,
    pub fields_remapped: u64,
    pub dangling_references: usize,

    /// Tables whose replication failed.
    pub failed_tables: Vec<String>,

    /// Tables whose remap failed; they stay replicated and are retried on resume.
    pub remap_failures: Vec<String>,

    /// Plan warnings.
    pub warnings: Vec<String>,

    pub tables: Vec<TableReport>,
}

impl MigrationReport {
    /// True when every table was replicated and remapped.
    ///
    /// Dangling references do not count as failures.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Row, record and remap-entry counts of one table after a run.
#[derive(Debug, Clone, Serialize)]
pub struct TableValidation {
    pub table: String,
    pub source_rows: i64,
    pub target_records: u64,
    pub remap_entries: u64,
    pub has_primary_key: bool,
    pub matches: bool,
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    /// Kind of source store, e.g. `mssql`.
    pub source_type: String,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    /// Kind of target store, e.g. `mongodb`.
    pub target_type: String,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}
