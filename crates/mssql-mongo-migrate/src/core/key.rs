//! Old primary-key values used to address remap entries.
//!
//! Keys are normalised from their BSON form on both sides of the remap: the
//! replicator derives a row's key from the BSON it writes, and the remapper
//! derives the lookup key from the BSON it reads back. An `int` foreign key
//! therefore matches a `bigint` primary key.

use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::identifier::Identifier;
use super::row::{SourceRow, ID_FIELD};

/// Field of a remap document holding the new identifier.
pub const NEW_ID_FIELD: &str = "new";

/// A single primary-key component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PkValue {
    /// Any integer width.
    Int(i64),
    /// Text, including uniqueidentifier and decimal keys.
    String(String),
    /// Binary keys.
    Bytes(Vec<u8>),
    /// Date/time keys as UTC milliseconds.
    DateTime(i64),
    /// Bit keys.
    Bool(bool),
}

impl PkValue {
    /// Normalise a BSON value into a key component.
    ///
    /// Returns `None` for values that cannot act as keys: null, floating
    /// point, documents, arrays, and surrogate identifiers.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Int32(v) => Some(PkValue::Int(i64::from(*v))),
            Bson::Int64(v) => Some(PkValue::Int(*v)),
            Bson::String(v) => Some(PkValue::String(v.clone())),
            Bson::Boolean(v) => Some(PkValue::Bool(*v)),
            Bson::DateTime(v) => Some(PkValue::DateTime(v.timestamp_millis())),
            Bson::Binary(b) if b.subtype == BinarySubtype::Generic => {
                Some(PkValue::Bytes(b.bytes.clone()))
            }
            _ => None,
        }
    }

    /// BSON form stored in the remap collection.
    pub fn to_bson(&self) -> Bson {
        match self {
            PkValue::Int(v) => Bson::Int64(*v),
            PkValue::String(v) => Bson::String(v.clone()),
            PkValue::Bytes(v) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: v.clone(),
            }),
            PkValue::DateTime(v) => Bson::DateTime(mongodb::bson::DateTime::from_millis(*v)),
            PkValue::Bool(v) => Bson::Boolean(*v),
        }
    }
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(v) => write!(f, "{}", v),
            PkValue::String(v) => write!(f, "'{}'", v),
            PkValue::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            PkValue::DateTime(v) => write!(f, "@{}ms", v),
            PkValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for PkValue {
    fn from(v: i64) -> Self {
        PkValue::Int(v)
    }
}

impl From<i32> for PkValue {
    fn from(v: i32) -> Self {
        PkValue::Int(v as i64)
    }
}

impl From<&str> for PkValue {
    fn from(v: &str) -> Self {
        PkValue::String(v.to_string())
    }
}

/// The pre-migration primary key of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OldKey {
    /// Single-column primary key.
    Scalar(PkValue),
    /// Multi-column primary key, in declared column order.
    Composite(Vec<PkValue>),
}

impl OldKey {
    /// Compute a row's key from its primary-key columns.
    ///
    /// Returns `None` if a key column is missing, null, or holds a value that
    /// cannot act as a key.
    pub fn from_row(row: &SourceRow, pk_columns: &[String]) -> Option<Self> {
        let mut parts = Vec::with_capacity(pk_columns.len());
        for col in pk_columns {
            let value = row.get(col)?;
            parts.push(PkValue::from_bson(&value.to_bson())?);
        }
        match parts.len() {
            0 => None,
            1 => parts.pop().map(OldKey::Scalar),
            _ => Some(OldKey::Composite(parts)),
        }
    }

    /// Key for a single foreign-key field value.
    pub fn from_field(value: &Bson) -> Option<Self> {
        PkValue::from_bson(value).map(OldKey::Scalar)
    }

    /// BSON form stored as the remap entry's `_id`.
    ///
    /// MongoDB rejects arrays as `_id`, so composite keys become an embedded
    /// document with positional field names (`{"0": .., "1": ..}`).
    pub fn to_bson(&self) -> Bson {
        match self {
            OldKey::Scalar(v) => v.to_bson(),
            OldKey::Composite(parts) => Bson::Document(
                parts
                    .iter()
                    .enumerate()
                    .map(|(i, part)| (i.to_string(), part.to_bson()))
                    .collect(),
            ),
        }
    }

    /// Parse a remap entry's `_id` back into a key.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Document(parts) => parts
                .values()
                .map(PkValue::from_bson)
                .collect::<Option<Vec<_>>>()
                .map(OldKey::Composite),
            other => PkValue::from_bson(other).map(OldKey::Scalar),
        }
    }
}

impl fmt::Display for OldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OldKey::Scalar(v) => write!(f, "{}", v),
            OldKey::Composite(parts) => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Durable mapping from a row's old primary key to its surrogate identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRemapEntry {
    pub old_key: OldKey,
    pub new_id: Identifier,
}

impl KeyRemapEntry {
    /// Remap collection document: `{ _id: <old key>, new: <identifier> }`.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD, self.old_key.to_bson());
        doc.insert(NEW_ID_FIELD, self.new_id.to_bson());
        doc
    }

    /// Parse a remap collection document.
    pub fn from_document(document: &Document) -> Option<Self> {
        let old_key = document.get(ID_FIELD).and_then(OldKey::from_bson)?;
        let new_id = document.get(NEW_ID_FIELD).and_then(Identifier::from_bson)?;
        Some(Self { old_key, new_id })
    }
}
