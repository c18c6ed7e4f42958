//! Migration configuration loaded from the environment

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::runner::RunnerOptions;
use crate::state::TargetDatabase;

/// How the runner behaves when another run holds the target's lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Fail with `MigrationInProgress` immediately
    FailFast,
    /// Poll every `poll_interval` until `timeout` elapses
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
}

impl LockMode {
    pub fn wait(timeout: Duration) -> Self {
        LockMode::Wait {
            timeout,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::FailFast
    }
}

/// Migration configuration
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Connection string of the target database
    pub database_url: Option<String>,
    /// Directory holding `<namespace>/<name>.json` artifacts
    pub migrations_dir: PathBuf,
    /// Table recording applied migrations
    pub migrations_table: String,
    /// Explicit target identity; derived from the URL when absent
    pub target: Option<String>,
    pub lock_mode: LockMode,
    pub node_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "elif_migrations".to_string(),
            target: None,
            lock_mode: LockMode::FailFast,
            node_timeout: None,
            log_level: "info".to_string(),
        }
    }
}

impl MigrationConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lock_timeout = parse_secs(&lookup, "MIGRATION_LOCK_TIMEOUT_SECS")?.unwrap_or(0);
        let lock_mode = if lock_timeout == 0 {
            LockMode::FailFast
        } else {
            LockMode::wait(Duration::from_secs(lock_timeout))
        };

        let node_timeout = parse_secs(&lookup, "MIGRATION_NODE_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            migrations_dir: lookup("MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.migrations_dir),
            migrations_table: lookup("MIGRATIONS_TABLE").unwrap_or(defaults.migrations_table),
            target: lookup("MIGRATION_TARGET"),
            lock_mode,
            node_timeout,
            log_level: lookup("MIGRATION_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migrations_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "migrations_dir".to_string(),
                reason: "Migrations directory cannot be empty".to_string(),
            });
        }

        let table = &self.migrations_table;
        let valid_table = !table.is_empty()
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !table.starts_with(|c: char| c.is_ascii_digit());
        if !valid_table {
            return Err(ConfigError::InvalidValue {
                field: "migrations_table".to_string(),
                value: table.clone(),
                expected: "an unquoted SQL identifier".to_string(),
            });
        }

        if let Some(url) = &self.database_url {
            if url.trim().is_empty() {
                return Err(ConfigError::ValidationFailed {
                    field: "database_url".to_string(),
                    reason: "Database URL cannot be empty".to_string(),
                });
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: self.log_level.clone(),
                expected: "trace, debug, info, warn, or error".to_string(),
            });
        }

        if self.node_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationFailed {
                field: "node_timeout".to_string(),
                reason: "Node timeout must be positive when set".to_string(),
            });
        }

        Ok(())
    }

    /// The database URL, required by every command that touches the database
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar {
                var: "DATABASE_URL".to_string(),
            })
    }

    /// Identity used for lock scoping and state-store rows
    pub fn target_database(&self) -> Result<TargetDatabase, ConfigError> {
        if let Some(target) = &self.target {
            return Ok(TargetDatabase::new(target.clone()));
        }
        TargetDatabase::from_url(self.database_url()?)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            lock_mode: self.lock_mode,
            node_timeout: self.node_timeout,
        }
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_lowercase(),
                value: raw,
                expected: "a whole number of seconds".to_string(),
            }),
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = MigrationConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.migrations_table, "elif_migrations");
        assert_eq!(config.lock_mode, LockMode::FailFast);
        assert!(config.node_timeout.is_none());
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.database_url(),
            Err(ConfigError::MissingEnvVar { .. })
        ));
    }

    #[test]
    fn test_config_from_variables() {
        let config = MigrationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://app@db.internal:5432/shop"),
            ("MIGRATIONS_DIR", "db/migrations"),
            ("MIGRATIONS_TABLE", "schema_history"),
            ("MIGRATION_LOCK_TIMEOUT_SECS", "30"),
            ("MIGRATION_NODE_TIMEOUT_SECS", "120"),
            ("MIGRATION_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(config.migrations_table, "schema_history");
        assert_eq!(config.lock_mode, LockMode::wait(Duration::from_secs(30)));
        assert_eq!(config.node_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.target_database().unwrap().name(), "db.internal:5432/shop");
        assert!(config.validate().is_ok());

        let options = config.runner_options();
        assert_eq!(options.node_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_explicit_target_wins_over_url() {
        let config = MigrationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/shop"),
            ("MIGRATION_TARGET", "shop-primary"),
        ]))
        .unwrap();

        assert_eq!(config.target_database().unwrap().name(), "shop-primary");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = MigrationConfig::from_lookup(lookup_from(&[("MIGRATION_LOCK_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let config = MigrationConfig {
            migrations_table: "drop table; --".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MigrationConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
