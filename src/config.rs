//! Vault configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Close-group cardinality floor; quorum maths assume at least this.
pub const MIN_GROUP_SIZE: usize = 4;

/// New client accounts start with this many storage units.
pub const DEFAULT_MAID_ALLOWANCE: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Close-group cardinality; the commit quorum is `group_size - 1`.
    pub group_size: usize,

    /// How long the accumulator remembers a message.
    pub accumulator_ttl_secs: u64,

    /// How long an uncommitted action is held before being dropped.
    pub unresolved_ttl_secs: u64,

    /// Version-graph caps.
    pub max_versions: usize,
    pub max_branches: usize,

    /// Storage units granted to a new client account.
    pub default_maid_allowance: u64,

    /// Below this many online holders, re-replication is triggered.
    pub min_holders: usize,

    /// Root directory for the database and chunk store.
    pub vault_root_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            group_size: MIN_GROUP_SIZE,
            accumulator_ttl_secs: 300,
            unresolved_ttl_secs: 60,
            max_versions: 100,
            max_branches: 1,
            default_maid_allowance: DEFAULT_MAID_ALLOWANCE,
            min_holders: 3,
            vault_root_dir: PathBuf::from("vault_data"),
        }
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults for absent keys.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| VaultError::StorageFault(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_size < MIN_GROUP_SIZE {
            return Err(VaultError::StorageFault(format!(
                "group_size {} below minimum {}",
                self.group_size, MIN_GROUP_SIZE
            )));
        }
        Ok(())
    }

    pub fn accumulator_ttl(&self) -> Duration {
        Duration::from_secs(self.accumulator_ttl_secs)
    }

    pub fn unresolved_ttl(&self) -> Duration {
        Duration::from_secs(self.unresolved_ttl_secs)
    }

    /// Distinct originators required before a proposed action commits.
    pub fn quorum(&self) -> usize {
        self.group_size - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quorum(), 3);
        assert_eq!(config.max_branches, 1);
    }

    #[test]
    fn undersized_group_is_rejected() {
        let config = Config { group_size: 2, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"group_size": 8}"#).unwrap();
        assert_eq!(config.group_size, 8);
        assert_eq!(config.max_versions, 100);
    }
}
