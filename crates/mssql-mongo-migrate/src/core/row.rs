//! Rows read from the source and records written to the target.

use mongodb::bson::Document;
use std::sync::Arc;

use super::identifier::Identifier;
use super::value::SqlValue;

/// Name of the document field holding the surrogate identifier.
pub const ID_FIELD: &str = "_id";

/// One row of a source table, columns in table order.
///
/// Column names are shared between all rows of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl SourceRow {
    /// Create a row. Extra values beyond `columns` are dropped; missing
    /// trailing values read as NULL.
    pub fn new(columns: Arc<[String]>, mut values: Vec<SqlValue>) -> Self {
        values.resize(columns.len(), SqlValue::Null);
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value of a column, if the column exists.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Iterate `(column, value)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// A source row tagged with its surrogate identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedRecord {
    /// Surrogate key allocated at replication time.
    pub id: Identifier,
    /// The copied source row.
    pub row: SourceRow,
}

impl MigratedRecord {
    /// Render the record as a document: `_id` first, then the row's columns.
    ///
    /// A source column literally named `_id` is overwritten by the surrogate.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD, self.id.to_bson());
        for (col, value) in self.row.iter() {
            if col == ID_FIELD {
                continue;
            }
            doc.insert(col, value.to_bson());
        }
        doc
    }
}

/// A migrated record as read back from the target.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Surrogate identifier (`_id`).
    pub id: Identifier,
    /// Full document, including `_id`.
    pub document: Document,
}

impl StoredRecord {
    /// Build from a target document. Returns `None` if `_id` is not an identifier.
    pub fn from_document(document: Document) -> Option<Self> {
        let id = document.get(ID_FIELD).and_then(Identifier::from_bson)?;
        Some(Self { id, document })
    }
}
