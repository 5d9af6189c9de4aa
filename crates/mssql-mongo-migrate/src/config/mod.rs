//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    ///
    /// Tuning knobs (workers, pool size, timeouts) are left out so a resumed
    /// run may use different concurrency.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.host.as_bytes());
        hasher.update(self.source.port.to_be_bytes());
        hasher.update(self.source.database.as_bytes());
        hasher.update(self.target.uri.as_bytes());
        hasher.update(self.target.database.as_bytes());
        let mut skip: Vec<_> = self.migration.skip.iter().collect();
        skip.sort();
        for table in skip {
            hasher.update(table.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.migration.remap_suffix.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl MigrationConfig {
    /// The skip-list as a set for exact-match lookups.
    pub fn skip_set(&self) -> HashSet<String> {
        self.skip.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: sqlhost
  database: AdventureWorks2016_EXT
  user: sa
  password: secret
target:
  uri: mongodb://localhost:27017
  database: AdventureWorks2016_EXT
migration:
  skip:
    - dbo.ErrorLog
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.migration.target_mode, TargetMode::DropRecreate);
        assert_eq!(config.migration.primary_keys_collection, "primaryKeys");
        assert_eq!(config.migration.remap_suffix, "-pkremap");
        assert!(config.migration.skip_set().contains("dbo.ErrorLog"));
    }

    #[test]
    fn test_hash_ignores_tuning() {
        let a = Config::from_yaml(YAML).unwrap();
        let mut b = a.clone();
        b.migration.workers = Some(12);
        assert_eq!(a.hash(), b.hash());

        b.migration.skip.push("dbo.AWBuildVersion".into());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_missing_target_section_is_error() {
        let yaml = "source:\n  host: h\n  database: d\n  user: u\n";
        assert!(Config::from_yaml(yaml).is_err());
    }
}
