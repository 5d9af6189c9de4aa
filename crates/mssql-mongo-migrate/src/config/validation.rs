//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }

    // Target validation
    if !config.target.uri.starts_with("mongodb://") && !config.target.uri.starts_with("mongodb+srv://") {
        return Err(MigrateError::Config(
            "target.uri must start with 'mongodb://' or 'mongodb+srv://'".into(),
        ));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }

    // Migration config validation - only check if explicitly set
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.max_mssql_connections {
        return Err(MigrateError::Config(
            "migration.max_mssql_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.table_timeout_secs {
        return Err(MigrateError::Config(
            "migration.table_timeout_secs must be at least 1".into(),
        ));
    }
    if config.migration.remap_suffix.is_empty() {
        return Err(MigrateError::Config(
            "migration.remap_suffix cannot be empty".into(),
        ));
    }
    if config.migration.primary_keys_collection.is_empty() {
        return Err(MigrateError::Config(
            "migration.primary_keys_collection cannot be empty".into(),
        ));
    }
    if let Some(bad) = config.migration.skip.iter().find(|t| !t.contains('.')) {
        return Err(MigrateError::Config(format!(
            "migration.skip entries must be fully qualified (schema.table), got '{}'",
            bad
        )));
    }

    Ok(())
}
