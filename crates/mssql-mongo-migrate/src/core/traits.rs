//! Core traits for the replicate-then-remap migration.
//!
//! The orchestrator, replicator and remapper only talk to these seams:
//!
//! - [`CatalogReader`]: tables, primary keys and foreign keys of the source
//! - [`SourceStore`]: reads full tables from the relational source
//! - [`TargetStore`]: collections in the document store
//! - [`RemapStore`]: append-only old-key → identifier mappings per table
//!
//! SQL Server and MongoDB implement them for real runs; the in-memory
//! backends in [`crate::memory`] implement them for tests.
//!
//! # Phase barrier
//!
//! A table's [`RemapStore`] entries are written once, by that table's
//! replicator, and only read afterwards. Readers never run before every
//! writer has finished, so no locking beyond the barrier is required.

use async_trait::async_trait;
use mongodb::bson::Document;
use std::collections::{HashMap, HashSet};

use crate::error::Result;

use super::identifier::Identifier;
use super::key::{KeyRemapEntry, OldKey};
use super::row::{MigratedRecord, SourceRow, StoredRecord};
use super::schema::{ForeignKeyDescriptor, PrimaryKeyRow, TablePlan};

/// All remap entries of one table, keyed by old primary key.
pub type RemapIndex = HashMap<OldKey, Identifier>;

/// Read-only view of the source schema.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// List base tables as `schema.table`, excluding names found in `skip`.
    async fn list_tables(&self, skip: &HashSet<String>) -> Result<Vec<String>>;

    /// Primary key columns of a table in key order, or `None` if it has none.
    async fn primary_key_columns(&self, table: &str) -> Result<Option<Vec<String>>>;

    /// Single-column foreign keys declared on a table.
    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>>;

    /// Raw primary-key catalog rows, persisted for audit.
    async fn primary_key_rows(&self) -> Result<Vec<PrimaryKeyRow>>;

    /// Resolve keys and foreign keys of a table.
    async fn plan_table(&self, table: &str) -> Result<TablePlan> {
        let primary_key = self
            .primary_key_columns(table)
            .await?
            .filter(|cols| !cols.is_empty());
        let foreign_keys = self.foreign_keys(table).await?;
        Ok(TablePlan {
            name: table.to_string(),
            primary_key,
            foreign_keys,
        })
    }
}

/// Relational source of rows.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Read every row of a table.
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>>;

    /// Exact row count of a table.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Database type identifier (e.g. "mssql").
    fn db_type(&self) -> &str;
}

/// Document store receiving the migrated records.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert all records of a table in one bulk operation.
    ///
    /// Returns the number of inserted records. A failure means the table's
    /// replication failed; no partial result is assumed usable.
    async fn bulk_insert(&self, collection: &str, records: &[MigratedRecord]) -> Result<u64>;

    /// Load every record of a collection.
    async fn find_all(&self, collection: &str) -> Result<Vec<StoredRecord>>;

    /// Set fields on the record with the given identifier.
    async fn update_fields(
        &self,
        collection: &str,
        id: &Identifier,
        fields: Document,
    ) -> Result<()>;

    /// Drop a collection if it exists.
    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Replace the contents of an auxiliary collection.
    async fn replace_audit(&self, collection: &str, documents: Vec<Document>) -> Result<()>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<u64>;

    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Database type identifier (e.g. "mongodb").
    fn db_type(&self) -> &str;
}

/// Durable, append-only old-key → identifier store, one namespace per table.
#[async_trait]
pub trait RemapStore: Send + Sync {
    /// Append entries for a table. Old keys must be new to the table.
    async fn append(&self, table: &str, entries: &[KeyRemapEntry]) -> Result<()>;

    /// Look up the identifier assigned to an old key.
    async fn find_by_old_key(&self, table: &str, key: &OldKey) -> Result<Option<Identifier>>;

    /// Load every entry of a table.
    async fn load(&self, table: &str) -> Result<RemapIndex>;

    /// Remove every entry of a table (before re-replicating it).
    async fn clear(&self, table: &str) -> Result<()>;

    /// Number of entries for a table.
    async fn entry_count(&self, table: &str) -> Result<u64>;
}
