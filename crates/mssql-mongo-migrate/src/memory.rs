//! In-memory catalog, source and target.
//!
//! These back the integration tests and let a migration be exercised without a
//! SQL Server or MongoDB instance. The target enforces the same uniqueness
//! rules MongoDB does: `_id` is unique per collection and old keys are unique
//! per remap namespace.

use crate::core::{
    CatalogReader, ForeignKeyDescriptor, Identifier, KeyRemapEntry, MigratedRecord, OldKey,
    PrimaryKeyRow, RemapIndex, RemapStore, SourceRow, SourceStore, SqlValue, StoredRecord,
    TargetStore, ID_FIELD,
};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use mongodb::bson::Document;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Definition of one in-memory source table.
#[derive(Debug, Clone)]
pub struct TableDef {
    name: String,
    columns: Arc<[String]>,
    rows: Vec<Vec<SqlValue>>,
    primary_key: Option<Vec<String>>,
    foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TableDef {
    /// Start a table with the given `schema.table` name and columns.
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().into(),
            rows: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    /// Declare the primary key columns, in key order.
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Declare a single-column foreign key.
    pub fn foreign_key(mut self, column: &str, referenced_table: &str) -> Self {
        self.foreign_keys
            .push(ForeignKeyDescriptor::new(column, referenced_table));
        self
    }

    /// Append a row, values in column order.
    pub fn row(mut self, values: Vec<SqlValue>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory relational source and catalog.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: BTreeMap<String, TableDef>,
    failing_reads: HashSet<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table.
    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Make every read of `table` fail.
    pub fn fail_reads_of(mut self, table: &str) -> Self {
        self.failing_reads.insert(table.to_string());
        self
    }

    fn table(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::SchemaExtraction(format!("table {} not found", name)))
    }
}

#[async_trait]
impl CatalogReader for MemorySource {
    async fn list_tables(&self, skip: &HashSet<String>) -> Result<Vec<String>> {
        Ok(self
            .tables
            .keys()
            .filter(|name| !skip.contains(*name))
            .cloned()
            .collect())
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Option<Vec<String>>> {
        Ok(self.table(table)?.primary_key.clone())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        Ok(self.table(table)?.foreign_keys.clone())
    }

    async fn primary_key_rows(&self) -> Result<Vec<PrimaryKeyRow>> {
        let mut rows = Vec::new();
        for table in self.tables.values() {
            let Some(pk) = &table.primary_key else {
                continue;
            };
            let constraint = format!("PK_{}", crate::core::split_table_name(&table.name).1);
            for (i, column) in pk.iter().enumerate() {
                rows.push(PrimaryKeyRow {
                    table_name: table.name.clone(),
                    constraint_name: constraint.clone(),
                    column_name: column.clone(),
                    ordinal_position: i as i32 + 1,
                });
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>> {
        if self.failing_reads.contains(table) {
            return Err(MigrateError::replication(table, "source read failed"));
        }
        let def = self.table(table)?;
        Ok(def
            .rows
            .iter()
            .map(|values| SourceRow::new(def.columns.clone(), values.clone()))
            .collect())
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        Ok(self.table(table)?.rows.len() as i64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

/// In-memory document store and remap store.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    remaps: RwLock<HashMap<String, RemapIndex>>,
    failing_inserts: HashSet<String>,
    /// Tables whose remap appends stop after this many entries.
    partial_appends: HashMap<String, usize>,
    insert_delay: Option<Duration>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every bulk insert into `collection` fail.
    pub fn fail_inserts_into(mut self, collection: &str) -> Self {
        self.failing_inserts.insert(collection.to_string());
        self
    }

    /// Make remap appends for `table` write the first `written` entries and
    /// then fail, like an unordered bulk write that broke off midway.
    pub fn fail_appends_into(mut self, table: &str, written: usize) -> Self {
        self.partial_appends.insert(table.to_string(), written);
        self
    }

    /// Delay every bulk insert, for timeout and cancellation tests.
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    /// Snapshot of a collection's documents in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of all existing collections, sorted.
    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn bulk_insert(&self, collection: &str, records: &[MigratedRecord]) -> Result<u64> {
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_inserts.contains(collection) {
            return Err(MigrateError::replication(collection, "bulk write rejected"));
        }

        let mut collections = self.collections.write().await;
        let existing = collections.entry(collection.to_string()).or_default();

        let mut seen: HashSet<Identifier> = existing
            .iter()
            .filter_map(|d| d.get(ID_FIELD).and_then(Identifier::from_bson))
            .collect();
        for record in records {
            if !seen.insert(record.id) {
                return Err(MigrateError::replication(
                    collection,
                    format!("duplicate _id {}", record.id),
                ));
            }
        }

        existing.extend(records.iter().map(MigratedRecord::to_document));
        Ok(records.len() as u64)
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        Ok(self
            .documents(collection)
            .await
            .into_iter()
            .filter_map(StoredRecord::from_document)
            .collect())
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &Identifier,
        fields: Document,
    ) -> Result<()> {
        let mut collections = self.collections.write().await;
        let target = id.to_bson();
        let document = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.get(ID_FIELD) == Some(&target)))
            .ok_or_else(|| {
                MigrateError::replication(collection, format!("record {} not found", id))
            })?;

        for (key, value) in fields {
            document.insert(key, value);
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn replace_audit(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        self.collections
            .write()
            .await
            .insert(collection.to_string(), documents);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map_or(0, |docs| docs.len() as u64))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl RemapStore for MemoryTarget {
    async fn append(&self, table: &str, entries: &[KeyRemapEntry]) -> Result<()> {
        let mut remaps = self.remaps.write().await;
        let index = remaps.entry(table.to_string()).or_default();

        let mut batch = HashSet::with_capacity(entries.len());
        for entry in entries {
            if index.contains_key(&entry.old_key) || !batch.insert(&entry.old_key) {
                return Err(MigrateError::replication(
                    table,
                    format!("duplicate old key {}", entry.old_key),
                ));
            }
        }

        let written = self.partial_appends.get(table).copied();
        for entry in entries.iter().take(written.unwrap_or(entries.len())) {
            index.insert(entry.old_key.clone(), entry.new_id);
        }
        if written.is_some() {
            return Err(MigrateError::replication(table, "remap write interrupted"));
        }
        Ok(())
    }

    async fn find_by_old_key(&self, table: &str, key: &OldKey) -> Result<Option<Identifier>> {
        Ok(self
            .remaps
            .read()
            .await
            .get(table)
            .and_then(|index| index.get(key).copied()))
    }

    async fn load(&self, table: &str) -> Result<RemapIndex> {
        Ok(self
            .remaps
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.remaps.write().await.remove(table);
        Ok(())
    }

    async fn entry_count(&self, table: &str) -> Result<u64> {
        Ok(self
            .remaps
            .read()
            .await
            .get(table)
            .map_or(0, |index| index.len() as u64))
    }
}
