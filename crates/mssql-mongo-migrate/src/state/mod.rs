//! Per-table migration state and the file-backed state used for resume.
//!
//! Each table moves through `Pending → Replicated → Remapped`, or ends in
//! `ReplicationFailed`. Transitions are driven only by the orchestrator's
//! phase sequencing; [`TableState`] rejects anything else.

use crate::core::TablePlan;
use crate::error::{MigrateError, Result};
use crate::remap::{DanglingReference, RemapResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Migration state for resume capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    /// Per-table state, keyed by `schema.table`.
    pub tables: BTreeMap<String, TableState>,

    /// When the migration completed (if finished).
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 signature for integrity validation.
    /// Computed over serialized state (excluding this field) using config_hash as key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Not yet replicated.
    Pending,
    /// Records and remap entries written.
    Replicated,
    /// Foreign keys rewritten.
    Remapped,
    /// Replication failed, was cancelled or timed out. Terminal.
    ReplicationFailed,
}

impl TableStatus {
    /// Check whether `next` is a legal successor of this status.
    pub fn can_transition_to(self, next: TableStatus) -> bool {
        matches!(
            (self, next),
            (TableStatus::Pending, TableStatus::Replicated)
                | (TableStatus::Pending, TableStatus::ReplicationFailed)
                | (TableStatus::Replicated, TableStatus::Remapped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Pending => "pending",
            TableStatus::Replicated => "replicated",
            TableStatus::Remapped => "remapped",
            TableStatus::ReplicationFailed => "replication_failed",
        }
    }
}

/// Per-table state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    /// Lifecycle status.
    pub status: TableStatus,

    /// Rows copied into the target collection.
    pub rows_replicated: u64,

    /// Remap entries written for this table.
    pub remap_entries: u64,

    /// Records whose foreign keys were rewritten.
    pub records_remapped: u64,

    /// Foreign-key fields rewritten to identifiers.
    #[serde(default)]
    pub fields_remapped: u64,

    /// Foreign-key values that could not be resolved, kept so a resumed
    /// run still reports them.
    #[serde(default)]
    pub dangling: Vec<DanglingReference>,

    /// When replication finished.
    pub replicated_at: Option<DateTime<Utc>>,

    /// When remapping finished.
    pub remapped_at: Option<DateTime<Utc>>,

    /// Error message if replication failed.
    pub error: Option<String>,
}

impl Default for TableState {
    fn default() -> Self {
        Self::new()
    }
}

impl TableState {
    /// Create a new pending table state.
    pub fn new() -> Self {
        Self {
            status: TableStatus::Pending,
            rows_replicated: 0,
            remap_entries: 0,
            records_remapped: 0,
            fields_remapped: 0,
            dangling: Vec::new(),
            replicated_at: None,
            remapped_at: None,
            error: None,
        }
    }

    fn transition(&mut self, next: TableStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MigrateError::State(format!(
                "illegal table transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Record a successful replication.
    pub fn mark_replicated(&mut self, rows: u64, remap_entries: u64) -> Result<()> {
        self.transition(TableStatus::Replicated)?;
        self.rows_replicated = rows;
        self.remap_entries = remap_entries;
        self.replicated_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failed replication.
    pub fn mark_failed(&mut self, error: &str) -> Result<()> {
        self.transition(TableStatus::ReplicationFailed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Record a completed remap.
    pub fn mark_remapped(&mut self, result: &RemapResult) -> Result<()> {
        self.transition(TableStatus::Remapped)?;
        self.records_remapped = result.records_updated;
        self.fields_remapped = result.fields_remapped;
        self.dangling = result.dangling.clone();
        self.remapped_at = Some(Utc::now());
        Ok(())
    }

    /// Send a remapped table back to `Replicated` so phase 2 runs on it again.
    ///
    /// Records already holding identifiers are left alone by the remapper, so
    /// a second pass only touches the references that were dangling.
    pub fn reopen_remap(&mut self) -> Result<()> {
        if self.status != TableStatus::Remapped {
            return Err(MigrateError::State(format!(
                "cannot reopen remap of a {} table",
                self.status.as_str()
            )));
        }
        self.status = TableStatus::Replicated;
        self.records_remapped = 0;
        self.fields_remapped = 0;
        self.dangling.clear();
        self.remapped_at = None;
        Ok(())
    }
}

impl MigrationState {
    /// Create a new migration state.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            tables: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    /// Compute HMAC-SHA256 signature for state integrity validation.
    fn compute_hmac(&self) -> Result<String> {
        let mut state_for_signing = self.clone();
        state_for_signing.hmac = None;

        let content = serde_json::to_string(&state_for_signing)?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file with integrity validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) => {
                if stored != &state.compute_hmac()? {
                    return Err(MigrateError::State(
                        "State file integrity check failed: HMAC mismatch".to_string(),
                    ));
                }
            }
            None => {
                return Err(MigrateError::State(
                    "State file has no HMAC signature".to_string(),
                ))
            }
        }

        Ok(state)
    }

    /// Save state to a file (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Get or create table state.
    pub fn get_or_create_table(&mut self, table_name: &str) -> &mut TableState {
        self.tables.entry(table_name.to_string()).or_default()
    }

    /// Status of a table, `Pending` if unknown.
    pub fn table_status(&self, table_name: &str) -> TableStatus {
        self.tables
            .get(table_name)
            .map(|t| t.status)
            .unwrap_or(TableStatus::Pending)
    }

    /// Reset tables that failed in an earlier run so a resumed run retries them.
    ///
    /// Returns the names of the reset tables.
    pub fn retry_failed(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for (name, table) in self.tables.iter_mut() {
            if table.status == TableStatus::ReplicationFailed {
                *table = TableState::new();
                reset.push(name.clone());
            }
        }
        reset
    }

    /// Reopen remapped tables holding a foreign key into any of `retried`.
    ///
    /// Their references into a table that failed earlier were left dangling;
    /// once that table is replicated again they can resolve. Returns the
    /// reopened tables.
    pub fn reopen_referencing(
        &mut self,
        retried: &[String],
        tables: &[TablePlan],
    ) -> Result<Vec<String>> {
        let mut reopened = Vec::new();
        if retried.is_empty() {
            return Ok(reopened);
        }

        for table in tables {
            let references_retried = table
                .foreign_keys
                .iter()
                .any(|fk| retried.contains(&fk.referenced_table));
            if !references_retried {
                continue;
            }
            if let Some(state) = self.tables.get_mut(&table.name) {
                if state.status == TableStatus::Remapped {
                    state.reopen_remap()?;
                    reopened.push(table.name.clone());
                }
            }
        }
        Ok(reopened)
    }

    /// Mark the migration as finished with the given status.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ForeignKeyDescriptor;
    use crate::core::{IdentifierAllocator, RandomIdAllocator};
    use mongodb::bson::Bson;
    use tempfile::NamedTempFile;

    fn remapped(records: u64, dangling: usize) -> RemapResult {
        let reference = DanglingReference {
            table: "dbo.Order".into(),
            record_id: RandomIdAllocator.allocate(),
            column: "PersonId".into(),
            referenced_table: "dbo.Person".into(),
            value: Bson::Int32(9),
        };
        RemapResult {
            table: "dbo.Order".into(),
            records_updated: records,
            fields_remapped: records,
            dangling: vec![reference; dangling],
            ..Default::default()
        }
    }

    fn plan(name: &str, references: &[&str]) -> TablePlan {
        TablePlan {
            name: name.to_string(),
            primary_key: Some(vec!["Id".to_string()]),
            foreign_keys: references
                .iter()
                .map(|t| ForeignKeyDescriptor::new("RefId", *t))
                .collect(),
        }
    }

    #[test]
    fn test_state_save_load() {
        let mut state = MigrationState::new("test-run".into(), "abc123".into());
        state.get_or_create_table("dbo.Person");
        state.get_or_create_table("dbo.Order");

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let loaded = MigrationState::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "test-run");
        assert_eq!(loaded.config_hash, "abc123");
        assert!(loaded.tables.contains_key("dbo.Person"));
        assert!(loaded.tables.contains_key("dbo.Order"));
    }

    #[test]
    fn test_config_validation() {
        let state = MigrationState::new("test-run".into(), "abc123".into());
        assert!(state.validate_config("abc123").is_ok());
        assert!(matches!(
            state.validate_config("different"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let mut state = MigrationState::new("test-run".into(), "abc123".into());
        state
            .get_or_create_table("dbo.Person")
            .mark_replicated(3, 3)
            .unwrap();

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let tampered = content.replace("\"rows_replicated\": 3", "\"rows_replicated\": 4");
        assert_ne!(content, tampered);
        std::fs::write(file.path(), tampered).unwrap();

        assert!(MigrationState::load(file.path()).is_err());
    }

    #[test]
    fn test_table_lifecycle() {
        let mut table = TableState::new();
        table.mark_replicated(10, 10).unwrap();
        table.mark_remapped(&remapped(4, 1)).unwrap();
        assert_eq!(table.status, TableStatus::Remapped);
        assert_eq!(table.records_remapped, 4);
        assert_eq!(table.fields_remapped, 4);
        assert_eq!(table.dangling.len(), 1);
        assert!(table.replicated_at.is_some());
        assert!(table.remapped_at.is_some());
    }

    #[test]
    fn test_remap_before_replication_is_rejected() {
        let mut table = TableState::new();
        assert!(table.mark_remapped(&remapped(1, 0)).is_err());
        assert_eq!(table.status, TableStatus::Pending);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut table = TableState::new();
        table.mark_failed("bulk write rejected").unwrap();
        assert!(table.mark_replicated(1, 1).is_err());
        assert!(table.mark_remapped(&remapped(1, 0)).is_err());
        assert_eq!(table.error.as_deref(), Some("bulk write rejected"));
    }

    #[test]
    fn test_retry_failed_resets_only_failed_tables() {
        let mut state = MigrationState::new("r".into(), "h".into());
        state.get_or_create_table("dbo.A").mark_failed("boom").unwrap();
        state.get_or_create_table("dbo.B").mark_replicated(1, 1).unwrap();

        assert_eq!(state.retry_failed(), vec!["dbo.A".to_string()]);
        assert_eq!(state.table_status("dbo.A"), TableStatus::Pending);
        assert!(state.tables["dbo.A"].error.is_none());
        assert_eq!(state.table_status("dbo.B"), TableStatus::Replicated);
    }

    #[test]
    fn test_unknown_table_is_pending() {
        let state = MigrationState::new("r".into(), "h".into());
        assert_eq!(state.table_status("dbo.Missing"), TableStatus::Pending);
    }

    #[test]
    fn test_dangling_references_survive_save_load() {
        let mut state = MigrationState::new("r".into(), "h".into());
        let order = state.get_or_create_table("dbo.Order");
        order.mark_replicated(3, 3).unwrap();
        order.mark_remapped(&remapped(1, 2)).unwrap();

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let loaded = MigrationState::load(file.path()).unwrap();
        let order = &loaded.tables["dbo.Order"];
        assert_eq!(order.fields_remapped, 1);
        assert_eq!(order.dangling.len(), 2);
        assert_eq!(order.dangling[0].value, Bson::Int32(9));
        assert_eq!(order.dangling[0].referenced_table, "dbo.Person");
    }

    #[test]
    fn test_state_without_dangling_field_still_loads() {
        let json = r#"{
            "status": "remapped",
            "rows_replicated": 2,
            "remap_entries": 2,
            "records_remapped": 1,
            "replicated_at": null,
            "remapped_at": null,
            "error": null
        }"#;
        let table: TableState = serde_json::from_str(json).unwrap();
        assert!(table.dangling.is_empty());
        assert_eq!(table.fields_remapped, 0);
    }

    #[test]
    fn test_reopen_referencing_retried_tables() {
        let mut state = MigrationState::new("r".into(), "h".into());
        state.get_or_create_table("dbo.Person").mark_failed("boom").unwrap();
        for name in ["dbo.Order", "dbo.Invoice"] {
            let table = state.get_or_create_table(name);
            table.mark_replicated(2, 2).unwrap();
            table.mark_remapped(&remapped(1, 1)).unwrap();
        }
        state.get_or_create_table("dbo.Note").mark_replicated(1, 1).unwrap();

        let tables = vec![
            plan("dbo.Person", &[]),
            plan("dbo.Order", &["dbo.Person"]),
            plan("dbo.Invoice", &["dbo.Order"]),
            plan("dbo.Note", &["dbo.Person"]),
        ];

        let retried = state.retry_failed();
        let reopened = state.reopen_referencing(&retried, &tables).unwrap();

        assert_eq!(reopened, vec!["dbo.Order".to_string()]);
        assert_eq!(state.table_status("dbo.Person"), TableStatus::Pending);
        assert_eq!(state.table_status("dbo.Order"), TableStatus::Replicated);
        assert!(state.tables["dbo.Order"].dangling.is_empty());
        assert!(state.tables["dbo.Order"].remapped_at.is_none());
        assert_eq!(state.table_status("dbo.Invoice"), TableStatus::Remapped);
        assert_eq!(state.table_status("dbo.Note"), TableStatus::Replicated);
    }

    #[test]
    fn test_reopen_requires_remapped() {
        let mut table = TableState::new();
        assert!(table.reopen_remap().is_err());
        table.mark_replicated(1, 1).unwrap();
        assert!(table.reopen_remap().is_err());
        assert_eq!(table.status, TableStatus::Replicated);
    }
}
