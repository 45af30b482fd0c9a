//! Database error types.

use thiserror::Error;

use crate::retry;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The connected database is older than the operation needs. Apply
    /// migrations first.
    #[error("{operation} requires schema version {required}, database is at {current}")]
    UnsupportedSchemaVersion {
        operation: &'static str,
        required: i64,
        current: i64,
    },

    #[error("referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    /// A migration script failed. Its version was not recorded.
    #[error("migration {version} failed: {source}")]
    MigrationFailure {
        version: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid migrations: {0}")]
    InvalidMigrations(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(#[from] cidb_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// SQLSTATE for `foreign_key_violation`.
const FOREIGN_KEY_VIOLATION: &str = "23503";

impl DbError {
    /// Map a statement error, lifting foreign-key violations out of the
    /// generic database variant.
    pub(crate) fn from_statement(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
                return DbError::ReferentialIntegrity(db.message().to_string());
            }
        }
        DbError::Database(err)
    }

    /// Whether this is a connection-level error that survived its retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Database(e) => retry::is_transient(e),
            _ => false,
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
