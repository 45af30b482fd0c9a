//! Process configuration parsing.
//!
//! ```kdl
//! database "cidb"
//! credentials "/creds/cidb_bot"
//! migrations "/opt/cidb/migrations"
//! retry max-retries=8 sleep-secs=4.0 backoff-factor=2.0
//! pool max-connections=4 acquire-timeout-secs=30
//! workers 15
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

pub const DEFAULT_DATABASE: &str = "cidb";

/// Retry behaviour for statements that hit transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay: Duration::from_secs(4),
            backoff_factor: 2.0,
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a CIDB client process needs to connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CidbConfig {
    /// Database name on the server.
    pub database: String,
    /// Directory holding `host.txt`, `user.txt`, ...
    pub credentials_dir: Option<PathBuf>,
    /// Directory of `<number>_<name>.sql` scripts. Embedded scripts are used when unset.
    pub migrations_dir: Option<PathBuf>,
    pub retry: RetrySettings,
    pub pool: PoolSettings,
    /// Concurrent workers used for slave build fan-out.
    pub workers: usize,
}

impl Default for CidbConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            credentials_dir: None,
            migrations_dir: None,
            retry: RetrySettings::default(),
            pool: PoolSettings::default(),
            workers: 15,
        }
    }
}

impl CidbConfig {
    /// Read and parse a KDL configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_config(&text)
    }

    pub fn credentials_dir(&self) -> ConfigResult<&Path> {
        self.credentials_dir
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("credentials".to_string()))
    }
}

/// Parse process configuration from KDL text. Unset fields keep their defaults.
pub fn parse_config(kdl: &str) -> ConfigResult<CidbConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = CidbConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                config.database = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("database name".to_string()))?;
            }
            "credentials" => {
                config.credentials_dir = get_first_string_arg(node).map(PathBuf::from);
            }
            "migrations" => {
                config.migrations_dir = get_first_string_arg(node).map(PathBuf::from);
            }
            "retry" => {
                config.retry = parse_retry(node)?;
            }
            "pool" => {
                config.pool = parse_pool(node)?;
            }
            "workers" => {
                let workers = get_first_integer_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workers count".to_string()))?;
                if workers < 1 {
                    return Err(ConfigError::InvalidValue {
                        field: "workers".to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                config.workers = usize::try_from(workers).map_err(|_| ConfigError::InvalidValue {
                    field: "workers".to_string(),
                    message: format!("out of range: {workers}"),
                })?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if config.database.is_empty() {
        return Err(ConfigError::MissingField("database name".to_string()));
    }

    Ok(config)
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetrySettings> {
    let mut retry = RetrySettings::default();

    if let Some(max_retries) = get_integer_prop(node, "max-retries") {
        retry.max_retries = u32::try_from(max_retries).map_err(|_| ConfigError::InvalidValue {
            field: "retry max-retries".to_string(),
            message: format!("out of range: {max_retries}"),
        })?;
    }
    if let Some(secs) = get_number_prop(node, "sleep-secs") {
        retry.initial_delay = non_negative_secs("retry sleep-secs", secs)?;
    }
    if let Some(factor) = get_number_prop(node, "backoff-factor") {
        if factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry backoff-factor".to_string(),
                message: format!("must be >= 1.0, got {factor}"),
            });
        }
        retry.backoff_factor = factor;
    }

    Ok(retry)
}

fn parse_pool(node: &KdlNode) -> ConfigResult<PoolSettings> {
    let mut pool = PoolSettings::default();

    if let Some(max) = get_integer_prop(node, "max-connections") {
        pool.max_connections = u32::try_from(max)
            .ok()
            .filter(|max| *max > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "pool max-connections".to_string(),
                message: format!("must be a positive integer, got {max}"),
            })?;
    }
    if let Some(secs) = get_number_prop(node, "acquire-timeout-secs") {
        pool.acquire_timeout = non_negative_secs("pool acquire-timeout-secs", secs)?;
    }

    Ok(pool)
}

fn non_negative_secs(field: &str, secs: f64) -> ConfigResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("not a valid duration: {secs}"),
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_integer_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

/// Accepts both `4` and `4.0`.
fn get_number_prop(node: &KdlNode, name: &str) -> Option<f64> {
    node.get(name).and_then(|v: &KdlValue| {
        v.as_float().or_else(|| v.as_integer().map(|i| i as f64))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            database "cidb_test"
            credentials "/creds/cidb_bot"
            migrations "/opt/cidb/migrations"
            retry max-retries=4 sleep-secs=1 backoff-factor=1.1
            pool max-connections=8 acquire-timeout-secs=5.5
            workers 15
        "#;

        let config = parse_config(kdl).unwrap();
        assert_eq!(config.database, "cidb_test");
        assert_eq!(config.credentials_dir, Some(PathBuf::from("/creds/cidb_bot")));
        assert_eq!(config.migrations_dir, Some(PathBuf::from("/opt/cidb/migrations")));
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.backoff_factor, 1.1);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(5500));
        assert_eq!(config.workers, 15);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, CidbConfig::default());
        assert_eq!(config.retry.max_retries, 8);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(4));
        assert!(config.credentials_dir().is_err());
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let result = parse_config("retry backoff-factor=0.5");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let result = parse_config("workers 0");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_bad_kdl() {
        let result = parse_config("database \"unterminated");
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }
}
