//! Configuration for CIDB clients.
//!
//! This crate handles:
//! - Credentials directories (`host.txt`, `port.txt`, `user.txt`, ...)
//! - Process configuration in KDL (`cidb.kdl`)

pub mod credentials;
pub mod error;
pub mod settings;

pub use credentials::{Credentials, TlsFiles};
pub use error::{ConfigError, ConfigResult};
pub use settings::{CidbConfig, PoolSettings, RetrySettings, parse_config};
