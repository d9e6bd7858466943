use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::txn::IsolationLevel;
use crate::{Result, TxnError};

/// Tunables for the transaction core, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TxnConfig {
    /// Start every connection with savepoints suppressed.
    pub ignore_savepoints: bool,
    /// Bound of the read-resolution queue.
    pub resolver_queue_capacity: usize,
    /// Cache terminal outcomes back onto row versions.
    pub read_resolution: bool,
    /// Longest parent chain walked before the chain is declared malformed.
    pub max_ancestor_depth: usize,
    /// Isolation level of new root transactions.
    pub default_isolation: IsolationLevel,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            ignore_savepoints: false,
            resolver_queue_capacity: 1024,
            read_resolution: true,
            max_ancestor_depth: 64,
            default_isolation: IsolationLevel::SnapshotIsolation,
        }
    }
}

impl TxnConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| TxnError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: TxnConfig = serde_yaml::from_str(text).map_err(|e| TxnError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.resolver_queue_capacity == 0 {
            return Err(TxnError::Config("resolver_queue_capacity must be positive".into()));
        }
        if self.max_ancestor_depth == 0 {
            return Err(TxnError::Config("max_ancestor_depth must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        assert_eq!(TxnConfig::from_yaml("{}").unwrap(), TxnConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let cfg = TxnConfig::from_yaml(
            "ignore_savepoints: true\nresolver_queue_capacity: 8\ndefault_isolation: read_uncommitted\n",
        )
        .unwrap();
        assert!(cfg.ignore_savepoints);
        assert_eq!(cfg.resolver_queue_capacity, 8);
        assert_eq!(cfg.default_isolation, IsolationLevel::ReadUncommitted);
        assert!(cfg.read_resolution);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(TxnConfig::from_yaml("max_ancestor_depth: 0"), Err(TxnError::Config(_))));
        assert!(matches!(TxnConfig::from_yaml("no_such_key: 1"), Err(TxnError::Config(_))));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join("si_txn_config_test.yaml");
        fs::write(&path, "read_resolution: false\n").unwrap();
        let cfg = TxnConfig::load(&path).unwrap();
        assert!(!cfg.read_resolution);
        fs::remove_file(&path).unwrap();
        assert!(TxnConfig::load(&path).is_err());
    }
}
