//! Schema migration commands.

use std::path::PathBuf;

use anyhow::Result;
use cidb_config::CidbConfig;
use cidb_db::{MigrationSet, apply_schema_migrations};
use serde_json::json;
use tracing::info;

pub async fn run(
    mut config: CidbConfig,
    target: Option<i64>,
    migrations_dir: Option<PathBuf>,
) -> Result<()> {
    if migrations_dir.is_some() {
        config.migrations_dir = migrations_dir;
    }
    let migrations = MigrationSet::from_config(&config)?;
    let conn = super::connect(&config).await?;

    let before = conn.schema_version();
    info!(
        database = %config.database,
        current = before,
        latest = migrations.latest_version(),
        "Applying migrations"
    );
    let after = apply_schema_migrations(&conn, &migrations, target).await?;

    super::print_json(&json!({
        "database": config.database,
        "previous_version": before,
        "schema_version": after,
    }))
}

pub async fn schema_version(config: &CidbConfig) -> Result<()> {
    let conn = super::connect(config).await?;
    super::print_json(&json!({
        "database": conn.database(),
        "schema_version": conn.schema_version(),
    }))
}
