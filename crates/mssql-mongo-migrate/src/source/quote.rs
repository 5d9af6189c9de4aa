//! Identifier validation and quoting for dynamically built SQL Server queries.
//!
//! Table and column names cannot be bound as parameters, so every name that
//! ends up in query text goes through [`quote_mssql`].

use crate::core::split_table_name;
use crate::error::{MigrateError, Result};

/// SQL Server identifier length limit (characters).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier: non-empty, no null bytes, within length limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Quote a fully qualified `schema.table` name.
pub fn qualify_mssql(full_name: &str) -> Result<String> {
    match split_table_name(full_name) {
        ("", table) => quote_mssql(table),
        (schema, table) => Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?)),
    }
}
