//! Catalog metadata types: foreign keys, primary-key catalog rows, table plans.
//!
//! Tables are addressed everywhere by their fully qualified `schema.table`
//! name, which is also the name of the target collection.

use serde::{Deserialize, Serialize};

/// Split a fully qualified `schema.table` name.
///
/// Names without a schema part are returned with an empty schema.
pub fn split_table_name(full_name: &str) -> (&str, &str) {
    match full_name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("", full_name),
    }
}

/// A foreign-key column and the table it references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    /// Column in the referencing table.
    pub source_column: String,

    /// Fully qualified name of the referenced table.
    pub referenced_table: String,
}

impl ForeignKeyDescriptor {
    pub fn new(source_column: impl Into<String>, referenced_table: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            referenced_table: referenced_table.into(),
        }
    }
}

/// One raw row of the primary-key catalog, persisted for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyRow {
    /// Fully qualified table name.
    #[serde(rename = "TABLE_NAME")]
    pub table_name: String,

    /// Primary key constraint name.
    #[serde(rename = "CONSTRAINT_NAME")]
    pub constraint_name: String,

    /// Key column name.
    #[serde(rename = "COLUMN_NAME")]
    pub column_name: String,

    /// 1-based position of the column within the key.
    #[serde(rename = "ORDINAL_POSITION")]
    pub ordinal_position: i32,
}

/// Everything the orchestrator knows about one table before moving data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePlan {
    /// Fully qualified table name.
    pub name: String,

    /// Primary key columns in key order; `None` when the table declares none.
    pub primary_key: Option<Vec<String>>,

    /// Foreign keys declared on this table.
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TablePlan {
    /// Check if the table has a declared primary key.
    pub fn has_pk(&self) -> bool {
        self.primary_key.as_ref().is_some_and(|pk| !pk.is_empty())
    }
}
