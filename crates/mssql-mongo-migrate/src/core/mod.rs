//! Core types shared by the replicator, remapper and store implementations.
//!
//! - [`identifier`]: surrogate identifiers and their allocator
//! - [`key`]: normalised old primary-key values
//! - [`value`]: SQL values and their BSON rendering
//! - [`row`]: source rows, migrated records, stored records
//! - [`schema`]: foreign keys, primary-key catalog rows, table plans
//! - [`traits`]: seams to the catalog, the source, the target and the remap store

pub mod identifier;
pub mod key;
pub mod row;
pub mod schema;
pub mod traits;
pub mod value;

pub use identifier::{Identifier, IdentifierAllocator, RandomIdAllocator};
pub use key::{KeyRemapEntry, OldKey, PkValue};
pub use row::{MigratedRecord, SourceRow, StoredRecord, ID_FIELD};
pub use schema::{split_table_name, ForeignKeyDescriptor, PrimaryKeyRow, TablePlan};
pub use traits::{CatalogReader, RemapIndex, RemapStore, SourceStore, TargetStore};
pub use value::SqlValue;
