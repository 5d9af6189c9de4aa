//! Phase 1: copy one table into its collection and record its remap entries.

use crate::core::{
    IdentifierAllocator, KeyRemapEntry, MigratedRecord, OldKey, RemapStore, SourceStore,
    TargetStore,
};
use crate::error::{MigrateError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of replicating one table.
#[derive(Debug, Clone)]
pub struct ReplicationResult {
    /// Fully qualified table name (also the collection name).
    pub table: String,

    /// Records written to the target collection.
    pub rows: u64,

    /// Remap entries written for the table.
    pub remap_entries: u64,

    /// Rows copied without a remap entry because a key column was null or
    /// not usable as a key.
    pub keyless_rows: u64,

    /// Whether the table declares a primary key.
    pub has_primary_key: bool,

    /// The source table had no rows; nothing was written.
    pub empty: bool,

    /// Wall time spent on the table.
    pub duration: Duration,
}

/// Copies a table into the target and writes its old-key → identifier entries.
///
/// Each source row gets a freshly allocated [`crate::Identifier`]. Records go
/// to the target in one bulk insert; remap entries are appended only once
/// that insert succeeded.
pub struct TableReplicator {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    remap: Arc<dyn RemapStore>,
    allocator: Arc<dyn IdentifierAllocator>,
}

impl TableReplicator {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        remap: Arc<dyn RemapStore>,
        allocator: Arc<dyn IdentifierAllocator>,
    ) -> Self {
        Self {
            source,
            target,
            remap,
            allocator,
        }
    }

    /// Replicate `table`, keyed by `primary_key` columns if it has any.
    pub async fn replicate(
        &self,
        table: &str,
        primary_key: Option<&[String]>,
    ) -> Result<ReplicationResult> {
        let start = Instant::now();
        let primary_key = primary_key.filter(|cols| !cols.is_empty());

        let rows = self.source.read_table(table).await?;
        debug!("{}: read {} rows", table, rows.len());

        let mut result = ReplicationResult {
            table: table.to_string(),
            rows: 0,
            remap_entries: 0,
            keyless_rows: 0,
            has_primary_key: primary_key.is_some(),
            empty: rows.is_empty(),
            duration: Duration::ZERO,
        };

        if primary_key.is_none() {
            warn!(
                "{}: no primary key; records are copied but cannot be referenced after migration",
                table
            );
        }

        if rows.is_empty() {
            info!("{}: empty table, nothing to replicate", table);
            result.duration = start.elapsed();
            return Ok(result);
        }

        let mut records = Vec::with_capacity(rows.len());
        let mut entries = Vec::with_capacity(if primary_key.is_some() { rows.len() } else { 0 });
        let mut seen: HashSet<OldKey> = HashSet::with_capacity(entries.capacity());

        for row in rows {
            let id = self.allocator.allocate();

            if let Some(pk) = primary_key {
                match OldKey::from_row(&row, pk) {
                    Some(old_key) => {
                        if !seen.insert(old_key.clone()) {
                            return Err(MigrateError::replication(
                                table,
                                format!("duplicate primary key {}", old_key),
                            ));
                        }
                        entries.push(KeyRemapEntry { old_key, new_id: id });
                    }
                    None => result.keyless_rows += 1,
                }
            }

            records.push(MigratedRecord { id, row });
        }

        if result.keyless_rows > 0 {
            warn!(
                "{}: {} rows have a null or unsupported key value and get no remap entry",
                table, result.keyless_rows
            );
        }

        result.rows = self
            .target
            .bulk_insert(table, &records)
            .await
            .map_err(|e| MigrateError::replication(table, format!("bulk insert failed: {}", e)))?;

        self.remap
            .append(table, &entries)
            .await
            .map_err(|e| MigrateError::replication(table, format!("writing remap entries failed: {}", e)))?;
        result.remap_entries = entries.len() as u64;

        result.duration = start.elapsed();
        info!(
            "{}: replicated {} rows, {} remap entries in {:.2}s",
            table,
            result.rows,
            result.remap_entries,
            result.duration.as_secs_f64()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Identifier, PkValue, RandomIdAllocator, SqlValue};
    use crate::memory::{MemorySource, MemoryTarget, TableDef};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Hands out predictable identifiers.
    struct SequentialAllocator(AtomicU64);

    impl IdentifierAllocator for SequentialAllocator {
        fn allocate(&self) -> Identifier {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Identifier::from_uuid(uuid::Uuid::from_u128(u128::from(n) + 1))
        }
    }

    fn replicator(source: MemorySource, target: Arc<MemoryTarget>) -> TableReplicator {
        TableReplicator::new(
            Arc::new(source),
            target.clone(),
            target,
            Arc::new(RandomIdAllocator),
        )
    }

    fn pk(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_replicates_rows_and_entries() {
        let source = MemorySource::new().with_table(
            TableDef::new("dbo.Person", &["PersonId", "Name"])
                .primary_key(&["PersonId"])
                .row(vec![SqlValue::I32(1), "Ann".into()])
                .row(vec![SqlValue::I32(2), "Bob".into()]),
        );
        let target = Arc::new(MemoryTarget::new());
        let result = replicator(source, target.clone())
            .replicate("dbo.Person", Some(&pk(&["PersonId"])))
            .await
            .unwrap();

        assert_eq!(result.rows, 2);
        assert_eq!(result.remap_entries, 2);
        assert!(result.has_primary_key);
        assert!(!result.empty);

        let index = target.load("dbo.Person").await.unwrap();
        let docs = target.documents("dbo.Person").await;
        let ann = index.get(&OldKey::Scalar(PkValue::Int(1))).unwrap();
        let ann_doc = docs
            .iter()
            .find(|d| d.get("_id") == Some(&ann.to_bson()))
            .unwrap();
        assert_eq!(ann_doc.get_str("Name").unwrap(), "Ann");
    }

    #[tokio::test]
    async fn test_empty_table_writes_nothing() {
        let source = MemorySource::new()
            .with_table(TableDef::new("dbo.Tag", &["TagId"]).primary_key(&["TagId"]));
        let target = Arc::new(MemoryTarget::new());
        let result = replicator(source, target.clone())
            .replicate("dbo.Tag", Some(&pk(&["TagId"])))
            .await
            .unwrap();

        assert!(result.empty);
        assert_eq!(result.rows, 0);
        assert!(target.collection_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_table_without_primary_key() {
        let source = MemorySource::new().with_table(
            TableDef::new("dbo.AuditLog", &["Message"]).row(vec!["started".into()]),
        );
        let target = Arc::new(MemoryTarget::new());
        let result = replicator(source, target.clone())
            .replicate("dbo.AuditLog", None)
            .await
            .unwrap();

        assert!(!result.has_primary_key);
        assert_eq!(result.rows, 1);
        assert_eq!(result.remap_entries, 0);
        assert_eq!(target.entry_count("dbo.AuditLog").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_keys_fail_the_table() {
        let source = MemorySource::new().with_table(
            TableDef::new("dbo.Person", &["PersonId"])
                .primary_key(&["PersonId"])
                .row(vec![SqlValue::I32(1)])
                .row(vec![SqlValue::I64(1)]),
        );
        let target = Arc::new(MemoryTarget::new());
        let err = replicator(source, target.clone())
            .replicate("dbo.Person", Some(&pk(&["PersonId"])))
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Replication { .. }));
        assert!(target.documents("dbo.Person").await.is_empty());
    }

    #[tokio::test]
    async fn test_null_key_rows_are_copied_without_entry() {
        let source = MemorySource::new().with_table(
            TableDef::new("dbo.Code", &["Code", "Label"])
                .primary_key(&["Code"])
                .row(vec!["A".into(), "alpha".into()])
                .row(vec![SqlValue::Null, "orphan".into()]),
        );
        let target = Arc::new(MemoryTarget::new());
        let result = replicator(source, target.clone())
            .replicate("dbo.Code", Some(&pk(&["Code"])))
            .await
            .unwrap();

        assert_eq!(result.rows, 2);
        assert_eq!(result.remap_entries, 1);
        assert_eq!(result.keyless_rows, 1);
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_entries() {
        let source = MemorySource::new().with_table(
            TableDef::new("dbo.Person", &["PersonId"])
                .primary_key(&["PersonId"])
                .row(vec![SqlValue::I32(1)]),
        );
        let target = Arc::new(MemoryTarget::new().fail_inserts_into("dbo.Person"));
        let result = replicator(source, target.clone())
            .replicate("dbo.Person", Some(&pk(&["PersonId"])))
            .await;

        assert!(result.is_err());
        assert_eq!(target.entry_count("dbo.Person").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allocator_is_used_per_row() {
        let source = MemorySource::new().with_table(
            TableDef::new("dbo.Person", &["PersonId"])
                .primary_key(&["PersonId"])
                .row(vec![SqlValue::I32(10)])
                .row(vec![SqlValue::I32(20)]),
        );
        let target = Arc::new(MemoryTarget::new());
        let replicator = TableReplicator::new(
            Arc::new(source),
            target.clone(),
            target.clone(),
            Arc::new(SequentialAllocator(AtomicU64::new(0))),
        );
        replicator
            .replicate("dbo.Person", Some(&pk(&["PersonId"])))
            .await
            .unwrap();

        let found = target
            .find_by_old_key("dbo.Person", &OldKey::Scalar(PkValue::Int(20)))
            .await
            .unwrap();
        assert_eq!(found, Some(Identifier::from_uuid(uuid::Uuid::from_u128(2))));
    }
}
