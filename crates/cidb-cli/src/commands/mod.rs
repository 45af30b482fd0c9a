//! CLI command implementations.

pub mod migrate;
pub mod query;
pub mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cidb_config::CidbConfig;
use cidb_db::{CidbConnection, PgCidb};
use serde::Serialize;

/// Load the configuration file, if any, and apply command-line overrides.
pub fn load_config(
    path: Option<&Path>,
    credentials_dir: Option<PathBuf>,
    database: Option<String>,
) -> Result<CidbConfig> {
    let mut config = match path {
        Some(path) => CidbConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => CidbConfig::default(),
    };
    if credentials_dir.is_some() {
        config.credentials_dir = credentials_dir;
    }
    if let Some(database) = database {
        config.database = database;
    }
    Ok(config)
}

async fn connect(config: &CidbConfig) -> Result<Arc<CidbConnection>> {
    let conn = CidbConnection::connect(config)
        .await
        .with_context(|| format!("Failed to connect to database {}", config.database))?;
    Ok(Arc::new(conn))
}

async fn open(config: &CidbConfig) -> Result<PgCidb> {
    Ok(PgCidb::new(connect(config).await?))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_without_config_file() {
        let config = load_config(None, Some("/creds".into()), Some("cidb_dev".into())).unwrap();
        assert_eq!(config.database, "cidb_dev");
        assert_eq!(config.credentials_dir.as_deref(), Some(Path::new("/creds")));
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = load_config(None, None, None).unwrap();
        assert_eq!(config, CidbConfig::default());
    }
}
