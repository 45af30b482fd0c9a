//! Connection manager.
//!
//! One [`CidbConnection`] is opened per process from a credentials directory
//! and handed to whatever needs the database. Every statement goes through
//! [`CidbConnection::run`], which retries transient failures.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use cidb_config::{CidbConfig, Credentials, PoolSettings};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, info};

use crate::retry::{self, RetryPolicy};
use crate::{DbError, DbResult};

const MAINTENANCE_DATABASE: &str = "postgres";

/// SQLSTATE for `duplicate_database`, raised when a concurrent process
/// created the database first.
const DUPLICATE_DATABASE: &str = "42P04";

const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schemaVersionTable (
    schemaVersion BIGINT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// A pooled connection to one CIDB database.
pub struct CidbConnection {
    pool: PgPool,
    server: PgConnectOptions,
    database: String,
    retry: RetryPolicy,
    schema_version: AtomicI64,
}

impl CidbConnection {
    /// Connect using the credentials directory and settings in `config`.
    pub async fn connect(config: &CidbConfig) -> DbResult<Self> {
        let credentials = Credentials::from_dir(config.credentials_dir()?)?;
        Self::connect_with(
            &credentials,
            &config.database,
            config.pool,
            config.retry.into(),
        )
        .await
    }

    /// Connect to `database`, creating it if it does not exist yet.
    pub async fn connect_with(
        credentials: &Credentials,
        database: &str,
        pool: PoolSettings,
        retry: RetryPolicy,
    ) -> DbResult<Self> {
        let server = connect_options(credentials);
        ensure_database(&server, database).await?;

        let pool = PgPoolOptions::new()
            .max_connections(pool.max_connections)
            .acquire_timeout(pool.acquire_timeout)
            .connect_with(server.clone().database(database))
            .await?;
        sqlx::raw_sql(CREATE_SCHEMA_VERSION_TABLE)
            .execute(&pool)
            .await?;

        let conn = Self {
            pool,
            server,
            database: database.to_string(),
            retry,
            schema_version: AtomicI64::new(0),
        };
        let version = conn.refresh_schema_version().await?;
        info!(
            host = %credentials.host,
            port = credentials.port,
            database,
            schema_version = version,
            "Opened cidb connection"
        );
        Ok(conn)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute one statement under the retry policy.
    ///
    /// `op` is invoked once per attempt and must rebuild its query each time.
    /// Inserts are not idempotent: if a commit succeeds but its reply is lost
    /// to a transient error, the retry writes the rows a second time.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        debug!(operation, "Executing cidb statement");
        self.retry
            .run(operation, retry::is_transient, op)
            .await
            .map_err(DbError::from_statement)
    }

    /// Current time according to the database clock.
    pub async fn get_time(&self) -> DbResult<DateTime<Utc>> {
        let pool = &self.pool;
        self.run("get_time", || {
            sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()").fetch_one(pool)
        })
        .await
    }

    /// Schema version as of the last refresh or migration.
    pub fn schema_version(&self) -> i64 {
        self.schema_version.load(Ordering::Acquire)
    }

    pub(crate) fn set_schema_version(&self, version: i64) {
        self.schema_version.store(version, Ordering::Release);
    }

    /// Re-read the highest applied migration from the database.
    pub async fn refresh_schema_version(&self) -> DbResult<i64> {
        let pool = &self.pool;
        let version = self
            .run("query_schema_version", || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COALESCE(MAX(schemaVersion), 0) FROM schemaVersionTable",
                )
                .fetch_one(pool)
            })
            .await?;
        self.set_schema_version(version);
        Ok(version)
    }

    /// Fail with [`DbError::UnsupportedSchemaVersion`] unless the database is
    /// at `required` or later.
    pub fn require_schema(&self, operation: &'static str, required: i64) -> DbResult<()> {
        let current = self.schema_version();
        if current < required {
            return Err(DbError::UnsupportedSchemaVersion {
                operation,
                required,
                current,
            });
        }
        Ok(())
    }

    /// Close the pool and drop the whole database. Test setup only.
    pub async fn drop_database(self) -> DbResult<()> {
        self.pool.close().await;
        let mut admin =
            PgConnection::connect_with(&self.server.clone().database(MAINTENANCE_DATABASE))
                .await?;
        let statement = format!("DROP DATABASE IF EXISTS {}", quote_ident(&self.database));
        sqlx::raw_sql(&statement).execute(&mut admin).await?;
        admin.close().await?;
        info!(database = %self.database, "Dropped cidb database");
        Ok(())
    }
}

fn connect_options(credentials: &Credentials) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&credentials.host)
        .port(credentials.port)
        .username(&credentials.user);
    if let Some(password) = &credentials.password {
        options = options.password(password);
    }
    if let Some(ca) = &credentials.tls.server_ca {
        options = options.ssl_mode(PgSslMode::VerifyCa).ssl_root_cert(ca);
    }
    if let (Some(cert), Some(key)) = (&credentials.tls.client_cert, &credentials.tls.client_key) {
        options = options.ssl_client_cert(cert).ssl_client_key(key);
    }
    options
}

async fn ensure_database(server: &PgConnectOptions, database: &str) -> DbResult<()> {
    let mut admin =
        PgConnection::connect_with(&server.clone().database(MAINTENANCE_DATABASE)).await?;
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(&mut admin)
            .await?;

    if !exists {
        let statement = format!("CREATE DATABASE {}", quote_ident(database));
        match sqlx::raw_sql(&statement).execute(&mut admin).await {
            Ok(_) => info!(database, "Created cidb database"),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_DATABASE) => {}
            Err(e) => return Err(e.into()),
        }
    }
    admin.close().await?;
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
