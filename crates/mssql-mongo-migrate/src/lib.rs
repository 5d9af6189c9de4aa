//! # mssql-mongo-migrate
//!
//! Replicate a SQL Server database into MongoDB and restore referential
//! integrity under MongoDB's surrogate identifiers.
//!
//! Every migrated record gets a fresh identifier as its `_id`, so foreign-key
//! columns copied from SQL Server go stale. A run therefore has two phases:
//!
//! - **Replicate**: bulk-copy each table into a collection of the same
//!   `schema.table` name, recording an old-key → identifier entry per row in
//!   the table's remap collection
//! - **Remap**: once every table is copied, rewrite each foreign-key field to
//!   the identifier of the record it referenced
//!
//! Unresolvable references are reported and left as they were.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_mongo_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_mongo_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let report = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Replicated {} rows", report.rows_replicated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod remap;
pub mod replicate;
pub mod source;
pub mod state;
pub mod target;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig, TargetMode};
pub use core::{
    CatalogReader, ForeignKeyDescriptor, Identifier, IdentifierAllocator, OldKey, RemapStore,
    SourceStore, SqlValue, TargetStore,
};
pub use error::{MigrateError, Result};
pub use orchestrator::{
    Backends, HealthCheckResult, MigrationPlan, MigrationReport, Orchestrator, TableReport,
    TableValidation,
};
pub use remap::{DanglingReference, ForeignKeyRemapper, RemapResult};
pub use replicate::{ReplicationResult, TableReplicator};
pub use source::MssqlPool;
pub use state::{MigrationState, RunStatus, TableStatus};
pub use target::MongoTarget;
