//! Database layer for the continuous-integration database (CIDB).
//!
//! Provides the connection manager with retries, the schema migration
//! engine, repository traits with a PostgreSQL implementation, and an
//! in-memory fake.

pub mod connection;
pub mod error;
pub mod fake;
pub mod migrate;
pub mod repo;
pub mod retry;
pub mod schema;

pub use connection::CidbConnection;
pub use error::{DbError, DbResult};
pub use fake::FakeCidb;
pub use migrate::{Migration, MigrationSet, apply_schema_migrations};
pub use repo::*;
pub use retry::RetryPolicy;
