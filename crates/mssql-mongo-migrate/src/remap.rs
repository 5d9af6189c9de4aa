//! Phase 2: rewrite foreign-key fields to the identifiers of the referenced records.
//!
//! Runs only after every table finished phase 1, so every remap entry that
//! will ever exist is already durable when lookups start.

use crate::core::{
    ForeignKeyDescriptor, Identifier, OldKey, RemapIndex, RemapStore, TargetStore,
};
use crate::error::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Concurrent record updates per table.
const UPDATE_CONCURRENCY: usize = 16;

/// A foreign-key value with no matching record in the referenced table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DanglingReference {
    /// Table holding the reference.
    pub table: String,
    /// Identifier of the record holding the reference.
    pub record_id: Identifier,
    /// Foreign-key column.
    pub column: String,
    /// Table the column references.
    pub referenced_table: String,
    /// The unresolved value, left in place.
    pub value: Bson,
}

/// Outcome of remapping one table.
#[derive(Debug, Clone, Default)]
pub struct RemapResult {
    pub table: String,
    /// The table declares no foreign keys.
    pub skipped: bool,
    pub records_scanned: u64,
    /// Records written back with at least one rewritten field.
    pub records_updated: u64,
    pub fields_remapped: u64,
    /// Fields that already held an identifier (resumed run).
    pub already_remapped: u64,
    pub dangling: Vec<DanglingReference>,
    pub duration: Duration,
}

/// Rewrites foreign-key fields of migrated records using the remap entries
/// written in phase 1.
pub struct ForeignKeyRemapper {
    target: Arc<dyn TargetStore>,
    remap: Arc<dyn RemapStore>,
}

impl ForeignKeyRemapper {
    pub fn new(target: Arc<dyn TargetStore>, remap: Arc<dyn RemapStore>) -> Self {
        Self { target, remap }
    }

    /// Remap every foreign-key field of `table`.
    ///
    /// Only the remap entries of tables in `replicated` are consulted. A
    /// reference into any other table (skipped, failed, or outside the run)
    /// is reported as dangling, whatever its remap collection holds.
    pub async fn remap(
        &self,
        table: &str,
        foreign_keys: &[ForeignKeyDescriptor],
        replicated: &HashSet<String>,
    ) -> Result<RemapResult> {
        let start = Instant::now();
        let mut result = RemapResult {
            table: table.to_string(),
            ..Default::default()
        };

        if foreign_keys.is_empty() {
            info!("{}: no foreign keys, nothing to remap", table);
            result.skipped = true;
            return Ok(result);
        }

        // Each referenced table's entries are loaded once for the whole call.
        let mut indexes: HashMap<&str, RemapIndex> = HashMap::new();
        for fk in foreign_keys {
            let referenced = fk.referenced_table.as_str();
            if !replicated.contains(referenced) {
                warn!(
                    "{}.{}: {} has no completed replication; its references stay dangling",
                    table, fk.source_column, referenced
                );
                continue;
            }
            if !indexes.contains_key(referenced) {
                let index = self.remap.load(referenced).await?;
                debug!("{}: loaded {} remap entries of {}", table, index.len(), referenced);
                indexes.insert(referenced, index);
            }
        }

        let records = self.target.find_all(table).await?;
        result.records_scanned = records.len() as u64;

        let mut updates: Vec<(Identifier, Document)> = Vec::new();
        for record in &records {
            let mut changes = Document::new();

            for fk in foreign_keys {
                let value = match record.document.get(&fk.source_column) {
                    None | Some(Bson::Null) => continue,
                    Some(value) => value,
                };

                if Identifier::from_bson(value).is_some() {
                    result.already_remapped += 1;
                    continue;
                }

                let new_id = OldKey::from_field(value).and_then(|key| {
                    indexes
                        .get(fk.referenced_table.as_str())
                        .and_then(|index| index.get(&key))
                });

                match new_id {
                    Some(new_id) => {
                        changes.insert(fk.source_column.clone(), new_id.to_bson());
                        result.fields_remapped += 1;
                    }
                    None => {
                        warn!(
                            "{}: dangling reference {}={} -> {} (record {})",
                            table, fk.source_column, value, fk.referenced_table, record.id
                        );
                        result.dangling.push(DanglingReference {
                            table: table.to_string(),
                            record_id: record.id,
                            column: fk.source_column.clone(),
                            referenced_table: fk.referenced_table.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }

            if !changes.is_empty() {
                updates.push((record.id, changes));
            }
        }

        result.records_updated = updates.len() as u64;

        stream::iter(updates)
            .map(|(id, fields)| async move { self.target.update_fields(table, &id, fields).await })
            .buffer_unordered(UPDATE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        result.duration = start.elapsed();
        info!(
            "{}: remapped {} fields in {} of {} records ({} dangling) in {:.2}s",
            table,
            result.fields_remapped,
            result.records_updated,
            result.records_scanned,
            result.dangling.len(),
            result.duration.as_secs_f64()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MigratedRecord, RandomIdAllocator, SqlValue};
    use crate::memory::{MemorySource, MemoryTarget, TableDef};
    use crate::replicate::TableReplicator;

    fn fk(column: &str, table: &str) -> Vec<ForeignKeyDescriptor> {
        vec![ForeignKeyDescriptor::new(column, table)]
    }

    fn replicated(tables: &[&str]) -> HashSet<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    async fn replicate_all(source: MemorySource, target: &Arc<MemoryTarget>, tables: &[(&str, &str)]) {
        let replicator = TableReplicator::new(
            Arc::new(source),
            target.clone(),
            target.clone(),
            Arc::new(RandomIdAllocator),
        );
        for (table, pk) in tables {
            let pk = vec![pk.to_string()];
            replicator.replicate(table, Some(&pk)).await.unwrap();
        }
    }

    fn person_order_source() -> MemorySource {
        MemorySource::new()
            .with_table(
                TableDef::new("dbo.Person", &["PersonId", "Name"])
                    .primary_key(&["PersonId"])
                    .row(vec![SqlValue::I32(1), "Ann".into()])
                    .row(vec![SqlValue::I32(2), "Bob".into()]),
            )
            .with_table(
                TableDef::new("dbo.Order", &["OrderId", "PersonId"])
                    .primary_key(&["OrderId"])
                    .foreign_key("PersonId", "dbo.Person")
                    .row(vec![SqlValue::I32(10), SqlValue::I32(1)])
                    .row(vec![SqlValue::I32(11), SqlValue::Null])
                    .row(vec![SqlValue::I32(12), SqlValue::I32(9)]),
            )
    }

    #[tokio::test]
    async fn test_no_foreign_keys_is_noop() {
        let target = Arc::new(MemoryTarget::new());
        let remapper = ForeignKeyRemapper::new(target.clone(), target);
        let result = remapper
            .remap("dbo.Person", &[], &replicated(&["dbo.Person"]))
            .await
            .unwrap();
        assert!(result.skipped);
        assert_eq!(result.records_scanned, 0);
    }

    #[tokio::test]
    async fn test_remaps_resolves_and_reports_dangling() {
        let target = Arc::new(MemoryTarget::new());
        replicate_all(
            person_order_source(),
            &target,
            &[("dbo.Person", "PersonId"), ("dbo.Order", "OrderId")],
        )
        .await;

        let remapper = ForeignKeyRemapper::new(target.clone(), target.clone());
        let result = remapper
            .remap(
                "dbo.Order",
                &fk("PersonId", "dbo.Person"),
                &replicated(&["dbo.Person", "dbo.Order"]),
            )
            .await
            .unwrap();

        assert_eq!(result.records_scanned, 3);
        assert_eq!(result.records_updated, 1);
        assert_eq!(result.fields_remapped, 1);
        assert_eq!(result.dangling.len(), 1);
        assert_eq!(result.dangling[0].value, Bson::Int32(9));

        let ann = target
            .find_by_old_key("dbo.Person", &OldKey::from_field(&Bson::Int32(1)).unwrap())
            .await
            .unwrap()
            .unwrap();
        let orders = target.documents("dbo.Order").await;
        let by_order = |id: i32| {
            orders
                .iter()
                .find(|d| d.get("OrderId") == Some(&Bson::Int32(id)))
                .unwrap()
                .get("PersonId")
                .cloned()
        };
        assert_eq!(by_order(10), Some(ann.to_bson()));
        assert_eq!(by_order(11), Some(Bson::Null));
        assert_eq!(by_order(12), Some(Bson::Int32(9)));
    }

    #[tokio::test]
    async fn test_second_pass_counts_already_remapped() {
        let target = Arc::new(MemoryTarget::new());
        replicate_all(
            person_order_source(),
            &target,
            &[("dbo.Person", "PersonId"), ("dbo.Order", "OrderId")],
        )
        .await;

        let remapper = ForeignKeyRemapper::new(target.clone(), target.clone());
        let fks = fk("PersonId", "dbo.Person");
        let done = replicated(&["dbo.Person", "dbo.Order"]);
        remapper.remap("dbo.Order", &fks, &done).await.unwrap();
        let again = remapper.remap("dbo.Order", &fks, &done).await.unwrap();

        assert_eq!(again.fields_remapped, 0);
        assert_eq!(again.records_updated, 0);
        assert_eq!(again.already_remapped, 1);
        assert_eq!(again.dangling.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_referenced_table_leaves_values() {
        let target = Arc::new(MemoryTarget::new());
        let record = MigratedRecord {
            id: crate::core::IdentifierAllocator::allocate(&RandomIdAllocator),
            row: crate::core::SourceRow::new(
                vec!["ShipperId".to_string()].into(),
                vec![SqlValue::I32(4)],
            ),
        };
        target.bulk_insert("dbo.Shipment", &[record]).await.unwrap();

        let remapper = ForeignKeyRemapper::new(target.clone(), target.clone());
        let result = remapper
            .remap(
                "dbo.Shipment",
                &fk("ShipperId", "dbo.Shipper"),
                &replicated(&["dbo.Shipment", "dbo.Shipper"]),
            )
            .await
            .unwrap();

        assert_eq!(result.dangling.len(), 1);
        assert_eq!(
            target.documents("dbo.Shipment").await[0].get("ShipperId"),
            Some(&Bson::Int32(4))
        );
    }

    #[tokio::test]
    async fn test_entries_of_unreplicated_table_are_ignored() {
        let target = Arc::new(MemoryTarget::new());
        replicate_all(
            person_order_source(),
            &target,
            &[("dbo.Person", "PersonId"), ("dbo.Order", "OrderId")],
        )
        .await;

        // Person has remap entries, but did not complete phase 1 in this run.
        let remapper = ForeignKeyRemapper::new(target.clone(), target.clone());
        let result = remapper
            .remap(
                "dbo.Order",
                &fk("PersonId", "dbo.Person"),
                &replicated(&["dbo.Order"]),
            )
            .await
            .unwrap();

        assert_eq!(result.fields_remapped, 0);
        assert_eq!(result.records_updated, 0);
        assert_eq!(result.dangling.len(), 2);
        let orders = target.documents("dbo.Order").await;
        assert!(orders
            .iter()
            .any(|d| d.get("PersonId") == Some(&Bson::Int32(1))));
    }
}
