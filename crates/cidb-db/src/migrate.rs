//! Schema migration engine.
//!
//! Migrations are SQL scripts named `<version>_<name>.sql`. Each one is
//! applied in its own transaction together with the row recording its
//! version in `schemaVersionTable`, so a failing script leaves the database
//! at the previous version.
//!
//! `sqlx::migrate!` is not used because callers pick a target version and
//! the applied set lives in the existing `schemaVersionTable`.

use std::path::Path;
use std::sync::LazyLock;

use cidb_config::CidbConfig;
use regex::Regex;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::{CidbConnection, DbError, DbResult};

static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?\d+)_([A-Za-z0-9_\-]+)\.sql$").unwrap());

macro_rules! embedded_migrations {
    ($($file:literal),* $(,)?) => {
        &[$(($file, include_str!(concat!("../migrations/", $file)))),*]
    };
}

static EMBEDDED: &[(&str, &str)] = embedded_migrations![
    "0001_build_table.sql",
    "0002_cl_action_table.sql",
    "0003_board_per_build_table.sql",
    "0004_build_stage_table.sql",
    "0005_failure_table.sql",
    "0006_build_deadline.sql",
    "0007_build_master_and_versions.sql",
    "0008_keyval_table.sql",
    "0009_build_message_table.sql",
    "0010_failure_view.sql",
    "0011_hw_test_result_table.sql",
    "0012_query_indexes.sql",
];

/// A single numbered migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub sql: String,
}

impl Migration {
    /// Build a migration from its file name, e.g. `0004_build_stage_table.sql`.
    pub fn from_file_name(file_name: &str, sql: impl Into<String>) -> DbResult<Self> {
        let captures = FILE_NAME.captures(file_name).ok_or_else(|| {
            DbError::InvalidMigrations(format!(
                "{file_name} is not named <version>_<name>.sql"
            ))
        })?;
        let version: i64 = captures[1].parse().map_err(|_| {
            DbError::InvalidMigrations(format!("{file_name} has an unparseable version"))
        })?;
        if version <= 0 {
            return Err(DbError::InvalidMigrations(format!(
                "{file_name} has non-positive version {version}"
            )));
        }
        Ok(Self {
            version,
            name: captures[2].to_string(),
            sql: sql.into(),
        })
    }
}

/// An ordered set of migrations with unique, positive versions.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(mut migrations: Vec<Migration>) -> DbResult<Self> {
        migrations.sort_by_key(|m| m.version);
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(DbError::InvalidMigrations(format!(
                "version {} is used by both {} and {}",
                pair[0].version, pair[0].name, pair[1].name
            )));
        }
        Ok(Self { migrations })
    }

    /// The scripts shipped with this crate.
    pub fn embedded() -> DbResult<Self> {
        EMBEDDED
            .iter()
            .map(|(file, sql)| Migration::from_file_name(file, *sql))
            .collect::<DbResult<Vec<_>>>()
            .and_then(Self::new)
    }

    /// Load every `*.sql` file in `dir`. Other files are ignored.
    pub fn discover(dir: impl AsRef<Path>) -> DbResult<Self> {
        let dir = dir.as_ref();
        let mut migrations = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "sql") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let sql = std::fs::read_to_string(&path)?;
            migrations.push(Migration::from_file_name(file_name, sql)?);
        }
        debug!(dir = %dir.display(), count = migrations.len(), "Discovered migrations");
        Self::new(migrations)
    }

    /// Scripts from the configured directory, or the embedded ones.
    pub fn from_config(config: &CidbConfig) -> DbResult<Self> {
        match &config.migrations_dir {
            Some(dir) => Self::discover(dir),
            None => Self::embedded(),
        }
    }

    /// Highest version in the set, or 0 when empty.
    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Migrations above `current` up to and including `target`, in order.
    pub fn pending(&self, current: i64, target: i64) -> impl Iterator<Item = &Migration> {
        self.iter()
            .filter(move |m| m.version > current && m.version <= target)
    }
}

/// Bring the schema up to `target` (default: the latest in `set`).
///
/// Already-applied versions are skipped, so a repeated call with the same
/// or a lower target does nothing. Returns the resulting schema version.
/// Migration statements are never retried.
pub async fn apply_schema_migrations(
    conn: &CidbConnection,
    set: &MigrationSet,
    target: Option<i64>,
) -> DbResult<i64> {
    let latest = set.latest_version();
    let target = target.unwrap_or(latest);
    if target > latest {
        return Err(DbError::InvalidMigrations(format!(
            "target version {target} is above the latest migration {latest}"
        )));
    }

    let mut current = conn.refresh_schema_version().await?;
    for migration in set.pending(current, target) {
        apply_one(conn.pool(), migration)
            .await
            .map_err(|source| DbError::MigrationFailure {
                version: migration.version,
                source,
            })?;
        current = migration.version;
        conn.set_schema_version(current);
        info!(
            version = migration.version,
            name = %migration.name,
            database = conn.database(),
            "Applied schema migration"
        );
    }
    Ok(current)
}

async fn apply_one(pool: &PgPool, migration: &Migration) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::raw_sql(&migration.sql).execute(&mut *tx).await?;
    sqlx::query("INSERT INTO schemaVersionTable (schemaVersion, applied_at) VALUES ($1, NOW())")
        .bind(migration.version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_embedded_migrations_are_contiguous() {
        let set = MigrationSet::embedded().unwrap();
        let versions: Vec<i64> = set.iter().map(|m| m.version).collect();
        assert_eq!(versions, (1..=12).collect::<Vec<_>>());
        assert_eq!(set.latest_version(), 12);
    }

    #[test]
    fn test_file_name_parsing() {
        let m = Migration::from_file_name("0004_build_stage_table.sql", "SELECT 1").unwrap();
        assert_eq!(m.version, 4);
        assert_eq!(m.name, "build_stage_table");

        assert!(Migration::from_file_name("0000_zero.sql", "").is_err());
        assert!(Migration::from_file_name("-3_negative.sql", "").is_err());
        assert!(Migration::from_file_name("build_table.sql", "").is_err());
    }

    #[test]
    fn test_discover_sorts_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("10_later.sql"), "SELECT 10").unwrap();
        fs::write(dir.path().join("2_earlier.sql"), "SELECT 2").unwrap();
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let set = MigrationSet::discover(dir.path()).unwrap();
        let versions: Vec<i64> = set.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 10]);
        assert_eq!(set.latest_version(), 10);
    }

    #[test]
    fn test_discover_rejects_duplicate_versions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("3_one.sql"), "SELECT 1").unwrap();
        fs::write(dir.path().join("003_two.sql"), "SELECT 2").unwrap();

        let err = MigrationSet::discover(dir.path()).unwrap_err();
        assert!(matches!(err, DbError::InvalidMigrations(_)));
    }

    #[test]
    fn test_pending_window() {
        let set = MigrationSet::embedded().unwrap();
        let pending: Vec<i64> = set.pending(4, 7).map(|m| m.version).collect();
        assert_eq!(pending, vec![5, 6, 7]);
        assert_eq!(set.pending(7, 7).count(), 0);
        assert_eq!(set.pending(9, 3).count(), 0);
    }

    #[test]
    fn test_from_config_prefers_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_only.sql"), "SELECT 1").unwrap();
        let config = CidbConfig {
            migrations_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(MigrationSet::from_config(&config).unwrap().len(), 1);
        assert_eq!(
            MigrationSet::from_config(&CidbConfig::default())
                .unwrap()
                .latest_version(),
            12
        );
    }

    #[test]
    fn test_empty_set() {
        let set = MigrationSet::default();
        assert!(set.is_empty());
        assert_eq!(set.latest_version(), 0);
    }
}
