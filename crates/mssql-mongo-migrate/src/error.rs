//! Error types for the migration library.

use thiserror::Error;

/// Exit code for configuration errors (invalid YAML, missing fields).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for source database errors.
pub const EXIT_SOURCE_ERROR: u8 = 2;
/// Exit code for target database errors.
pub const EXIT_TARGET_ERROR: u8 = 3;
/// Exit code when one or more tables failed to replicate.
pub const EXIT_REPLICATION_FAILED: u8 = 4;
/// Exit code for state file errors.
pub const EXIT_STATE_ERROR: u8 = 5;
/// Exit code when the run was cancelled.
pub const EXIT_CANCELLED: u8 = 6;
/// Exit code for IO errors (missing config file, unwritable state file).
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or write error
    #[error("Target database error: {0}")]
    Target(#[from] mongodb::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Catalog query failed
    #[error("Schema extraction failed: {0}")]
    SchemaExtraction(String),

    /// Replication failed for a specific table
    #[error("Replication failed for table {table}: {message}")]
    Replication { table: String, message: String },

    /// A value could not be represented in the target store
    #[error("Value conversion error: {0}")]
    Conversion(String),

    /// Illegal table state transition or state file problem
    #[error("State error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Start a fresh run instead.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Replication error
    pub fn replication(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Replication {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged => EXIT_CONFIG_ERROR,
            MigrateError::Source(_) | MigrateError::Pool { .. } | MigrateError::SchemaExtraction(_) => {
                EXIT_SOURCE_ERROR
            }
            MigrateError::Target(_) | MigrateError::Conversion(_) => EXIT_TARGET_ERROR,
            MigrateError::Replication { .. } => EXIT_REPLICATION_FAILED,
            MigrateError::State(_) | MigrateError::Json(_) => EXIT_STATE_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
