//! Credentials directory parsing.
//!
//! A credentials directory holds one value per plain-text file:
//!
//! ```text
//! host.txt        required
//! user.txt        required
//! port.txt        optional, defaults to 5432
//! password.txt    optional
//! client-cert.pem optional TLS client certificate
//! client-key.pem  optional TLS client key
//! server-ca.pem   optional CA used to verify the server
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{ConfigError, ConfigResult};

pub const DEFAULT_PORT: u16 = 5432;

/// TLS material found in a credentials directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub server_ca: Option<PathBuf>,
}

impl TlsFiles {
    pub fn is_empty(&self) -> bool {
        self.client_cert.is_none() && self.client_key.is_none() && self.server_ca.is_none()
    }
}

/// Connection parameters read from a credentials directory.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub tls: TlsFiles,
}

impl Credentials {
    /// Read credentials from `dir`. Values are whitespace-trimmed.
    pub fn from_dir(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ConfigError::MissingCredentialsDir(dir.to_path_buf()));
        }

        let host = read_value(dir, "host.txt")?
            .ok_or_else(|| ConfigError::MissingField("host.txt".to_string()))?;
        let user = read_value(dir, "user.txt")?
            .ok_or_else(|| ConfigError::MissingField("user.txt".to_string()))?;
        let port = match read_value(dir, "port.txt")? {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                field: "port.txt".to_string(),
                message: format!("not a port number: {raw}"),
            })?,
            None => DEFAULT_PORT,
        };
        let password = read_value(dir, "password.txt")?;

        let tls = TlsFiles {
            client_cert: existing_file(dir, "client-cert.pem"),
            client_key: existing_file(dir, "client-key.pem"),
            server_ca: existing_file(dir, "server-ca.pem"),
        };

        debug!(dir = %dir.display(), %host, port, %user, tls = !tls.is_empty(), "Read credentials");

        Ok(Self {
            host,
            port,
            user,
            password,
            tls,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

fn read_value(dir: &Path, name: &str) -> ConfigResult<Option<String>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }
    let value = std::fs::read_to_string(&path)?.trim().to_string();
    Ok(Some(value))
}

fn existing_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    path.is_file().then_some(path)
}
