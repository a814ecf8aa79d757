//! Connection parameters and SSH tunnel configuration models.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Dialect used when none is given.
pub const DEFAULT_DIALECT: &str = "postgresql";

/// Structured connection parameters, the decoded form of a connection URI.
///
/// A spec without a database name cannot be encoded; the URI codec returns an
/// empty string for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSpec {
    /// Database name (path component of the URI)
    pub database: Option<String>,
    /// Server hostname
    pub host: Option<String>,
    /// Server port
    #[serde(deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    /// Login role
    pub username: Option<String>,
    /// Password, only encoded when a username is present
    pub password: Option<String>,
    /// Engine family, e.g. "postgresql" or "sqlite"
    pub dialect: String,
    /// Client sub-protocol, e.g. "psycopg"
    pub driver: Option<String>,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            database: None,
            host: None,
            port: None,
            username: None,
            password: None,
            dialect: DEFAULT_DIALECT.to_string(),
            driver: None,
        }
    }
}

impl ConnectionSpec {
    /// Create a PostgreSQL spec for the given database.
    pub fn new(database: impl Into<String>) -> Self {
        Self { database: Some(database.into()), ..Self::default() }
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the login credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: Option<impl Into<String>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password.map(Into::into);
        self
    }

    /// Set the dialect.
    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = dialect.into();
        self
    }

    /// Set an explicit driver.
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Check if a database name is present and non-empty.
    pub fn has_database(&self) -> bool {
        self.database.as_deref().is_some_and(|d| !d.is_empty())
    }
}

/// Accept a port as either an integer or a numeric string.
pub(crate) fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match Option::<RawPort>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawPort::Number(port)) => Ok(Some(port)),
        Some(RawPort::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(RawPort::Text(text)) => text
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {text:?}"))),
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum SshAuthMethod {
    /// Password authentication
    Password {
        /// SSH password
        password: String,
    },
    /// Private key authentication
    #[serde(rename_all = "camelCase")]
    KeyFile {
        /// Path to the private key
        path: PathBuf,
        /// Passphrase for an encrypted key
        passphrase: Option<String>,
    },
    /// SSH agent authentication
    #[default]
    Agent,
}

impl SshAuthMethod {
    /// Short name used in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::KeyFile { .. } => "key",
            Self::Agent => "agent",
        }
    }
}

/// SSH port-forwarding configuration.
///
/// The tunnel listens on `local_bind_host:local_bind_port` and forwards each
/// accepted connection to `remote_host:remote_port` as seen from the SSH host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port (default 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    #[serde(default)]
    pub auth: SshAuthMethod,
    /// Database host as seen from the SSH server
    pub remote_host: String,
    /// Database port as seen from the SSH server
    pub remote_port: u16,
    /// Local listener address
    #[serde(default = "default_bind_host")]
    pub local_bind_host: String,
    /// Local listener port, 0 picks an ephemeral port
    #[serde(default)]
    pub local_bind_port: u16,
    /// Additional forwarder options
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

impl TunnelConfig {
    /// Create a tunnel through `ssh_host` to `remote_host:remote_port`.
    pub fn new(
        ssh_host: impl Into<String>,
        username: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port: default_ssh_port(),
            username: username.into(),
            auth: SshAuthMethod::Agent,
            remote_host: remote_host.into(),
            remote_port,
            local_bind_host: default_bind_host(),
            local_bind_port: 0,
            extra: BTreeMap::new(),
        }
    }

    /// Set the SSH port.
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Set password-based authentication.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.auth = SshAuthMethod::Password { password: password.into() };
        self
    }

    /// Set key-based authentication.
    pub fn with_key(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.auth = SshAuthMethod::KeyFile { path: path.into(), passphrase };
        self
    }

    /// Set agent-based authentication.
    pub fn with_agent(mut self) -> Self {
        self.auth = SshAuthMethod::Agent;
        self
    }

    /// Set the local listener address.
    pub fn with_local_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_bind_host = host.into();
        self.local_bind_port = port;
        self
    }

    /// Add a forwarder option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_to_postgresql() {
        let spec = ConnectionSpec::new("mydatabase");
        assert_eq!(spec.dialect, "postgresql");
        assert!(spec.has_database());
        assert!(!ConnectionSpec::default().has_database());
        assert!(!ConnectionSpec::new("").has_database());
    }

    #[test]
    fn test_port_accepts_number_or_string() {
        let spec: ConnectionSpec =
            serde_json::from_str(r#"{"database": "db", "port": "5432"}"#).unwrap();
        assert_eq!(spec.port, Some(5432));

        let spec: ConnectionSpec =
            serde_json::from_str(r#"{"database": "db", "port": 12345}"#).unwrap();
        assert_eq!(spec.port, Some(12345));

        let spec: ConnectionSpec = serde_json::from_str(r#"{"database": "db"}"#).unwrap();
        assert_eq!(spec.port, None);
        assert_eq!(spec.dialect, "postgresql");

        assert!(serde_json::from_str::<ConnectionSpec>(r#"{"port": "abc"}"#).is_err());
    }

    #[test]
    fn test_tunnel_config_defaults() {
        let config: TunnelConfig = serde_json::from_str(
            r#"{"sshHost": "bastion", "username": "ops", "remoteHost": "db", "remotePort": 5432,
                "auth": {"method": "password", "password": "secret"}}"#,
        )
        .unwrap();
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.local_bind_host, "127.0.0.1");
        assert_eq!(config.local_bind_port, 0);
        assert_eq!(config.auth.as_str(), "password");

        let built = TunnelConfig::new("bastion", "ops", "db", 5432)
            .with_key("/home/ops/.ssh/id_ed25519", None)
            .with_option("keepalive_interval", "30");
        assert_eq!(built.auth.as_str(), "key");
        assert_eq!(built.extra.get("keepalive_interval").map(String::as_str), Some("30"));
    }
}
