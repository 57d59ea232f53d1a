//! Repository configuration
//!
//! Defaults come from `MEDIAVAULT_*` environment variables; a JSON file named
//! by `MEDIAVAULT_CONFIG` replaces them entirely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::versioning::VersionRetention;

pub const CONFIG_ENV: &str = "MEDIAVAULT_CONFIG";

/// Main repository configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Name given to the root node of a fresh repository
    pub root_name: String,
    /// Login name of the guest account used for anonymous requests
    pub guest_login: String,
    /// Version pruning applied after each commit; `None` keeps everything
    pub retention: Option<VersionRetention>,
    /// Workflow engine settings
    pub workflow: WorkflowConfig,
}

/// Workflow engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on step transitions per run, guards against step loops
    pub max_hops: usize,
    /// Length of keys generated by the protect step
    pub key_length: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Default for RepositoryConfig {
    /// Default configuration with env var overrides for container deployment
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

fn parse_with<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}

impl RepositoryConfig {
    /// Defaults with overrides taken from `lookup`, keyed by the
    /// `MEDIAVAULT_*` variable names. An age limit too large to represent
    /// disables age pruning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_versions: Option<usize> = parse_with(&lookup, "MEDIAVAULT_MAX_VERSIONS");
        let max_age_days: Option<u64> = parse_with(&lookup, "MEDIAVAULT_MAX_VERSION_AGE_DAYS");
        Self {
            root_name: lookup("MEDIAVAULT_ROOT_NAME").unwrap_or_else(|| "root".to_string()),
            guest_login: lookup("MEDIAVAULT_GUEST_USER").unwrap_or_else(|| "guest".to_string()),
            retention: max_versions.map(|max_versions| VersionRetention {
                max_versions,
                max_age: max_age_days
                    .and_then(|d| d.checked_mul(SECS_PER_DAY))
                    .map(Duration::from_secs),
            }),
            workflow: WorkflowConfig {
                max_hops: parse_with(&lookup, "MEDIAVAULT_WORKFLOW_MAX_HOPS").unwrap_or(64),
                key_length: parse_with(&lookup, "MEDIAVAULT_KEY_LENGTH").unwrap_or(16),
            },
        }
    }

    /// Load from the file named by `MEDIAVAULT_CONFIG`, or fall back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_name.is_empty() {
            return Err(ConfigError::Invalid("root_name must not be empty".into()));
        }
        if self.workflow.max_hops == 0 {
            return Err(ConfigError::Invalid("workflow.max_hops must be positive".into()));
        }
        if self.workflow.key_length == 0 {
            return Err(ConfigError::Invalid("workflow.key_length must be positive".into()));
        }
        if matches!(&self.retention, Some(r) if r.max_versions == 0) {
            return Err(ConfigError::Invalid(
                "retention.max_versions must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "root_name": "archive",
                "guest_login": "anonymous",
                "retention": {{ "max_versions": 10, "max_age": null }},
                "workflow": {{ "max_hops": 8, "key_length": 12 }}
            }}"#
        )
        .unwrap();
        let config = RepositoryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.root_name, "archive");
        assert_eq!(config.retention.unwrap().max_versions, 10);
        assert_eq!(config.workflow.key_length, 12);
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = RepositoryConfig::from_lookup(lookup_from(&[
            ("MEDIAVAULT_ROOT_NAME", "archive"),
            ("MEDIAVAULT_GUEST_USER", "visitor"),
            ("MEDIAVAULT_MAX_VERSIONS", "5"),
            ("MEDIAVAULT_MAX_VERSION_AGE_DAYS", "2"),
            ("MEDIAVAULT_WORKFLOW_MAX_HOPS", "9"),
            ("MEDIAVAULT_KEY_LENGTH", "not a number"),
        ]));
        assert_eq!(config.root_name, "archive");
        assert_eq!(config.guest_login, "visitor");
        let retention = config.retention.unwrap();
        assert_eq!(retention.max_versions, 5);
        assert_eq!(retention.max_age, Some(Duration::from_secs(2 * SECS_PER_DAY)));
        assert_eq!(config.workflow.max_hops, 9);
        assert_eq!(config.workflow.key_length, 16);
    }

    #[test]
    fn unset_env_gives_plain_defaults() {
        let config = RepositoryConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.root_name, "root");
        assert_eq!(config.guest_login, "guest");
        assert_eq!(config.retention, None);
        assert_eq!(config.workflow.max_hops, 64);
        config.validate().unwrap();
    }

    #[test]
    fn huge_age_limit_disables_age_pruning() {
        let config = RepositoryConfig::from_lookup(lookup_from(&[
            ("MEDIAVAULT_MAX_VERSIONS", "3"),
            ("MEDIAVAULT_MAX_VERSION_AGE_DAYS", &u64::MAX.to_string()),
        ]));
        assert_eq!(config.retention.unwrap().max_age, None);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = RepositoryConfig::default();
        config.workflow.max_hops = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reports_missing_file() {
        let err = RepositoryConfig::from_file(Path::new("/nonexistent/mediavault.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
