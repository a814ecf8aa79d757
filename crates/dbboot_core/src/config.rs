//! Serializable bootstrap configuration.
//!
//! A [`DatabaseConfig`] mirrors the [`DatabaseBuilder`] options that can be
//! expressed as data. It loads from JSON or from `DBBOOT_*` environment
//! variables.

use crate::database::DatabaseBuilder;
use crate::error::{DbBootError, DbResult};
use crate::models::{ConnectionSpec, TunnelConfig};
use crate::services::DEFAULT_SCHEMA;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of the environment variables read by [`DatabaseConfig::from_env`].
pub const ENV_PREFIX: &str = "DBBOOT_";

const DEFAULT_POSTGRES_PORT: u16 = 5432;

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

/// Bootstrap options as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Full connection URI; takes precedence over the parameters
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(flatten)]
    pub params: ConnectionSpec,
    #[serde(default)]
    pub db_has_tz: bool,
    #[serde(default)]
    pub reflect: bool,
    #[serde(default)]
    pub recreate_schema: bool,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// `pg_dump` archive restored before the engine is created
    #[serde(default)]
    pub backup_file: Option<PathBuf>,
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: None,
            params: ConnectionSpec::default(),
            db_has_tz: false,
            reflect: false,
            recreate_schema: false,
            schema: default_schema(),
            backup_file: None,
            tunnel: None,
        }
    }
}

impl DatabaseConfig {
    pub fn from_json_str(json: &str) -> DbResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbBootError::config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Read `DBBOOT_*` variables from the process environment.
    pub fn from_env() -> DbResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from `DBBOOT_*` style pairs; other keys are
    /// ignored.
    ///
    /// Setting `DBBOOT_SSH_HOST` enables the tunnel. Its remote end is the
    /// database host and port (5432 when unset).
    pub fn from_vars<I, K, V>(vars: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();
        let mut ssh = SshVars::default();

        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            match name {
                "URI" => config.uri = Some(value),
                "DATABASE" => config.params.database = Some(value),
                "HOST" => config.params.host = Some(value),
                "PORT" => config.params.port = Some(parse_port(name, &value)?),
                "USERNAME" => config.params.username = Some(value),
                "PASSWORD" => config.params.password = Some(value),
                "DIALECT" => config.params.dialect = value,
                "DRIVER" => config.params.driver = Some(value),
                "DB_HAS_TZ" => config.db_has_tz = parse_flag(name, &value)?,
                "REFLECT" => config.reflect = parse_flag(name, &value)?,
                "RECREATE_SCHEMA" => config.recreate_schema = parse_flag(name, &value)?,
                "SCHEMA" => config.schema = value,
                "BACKUP_FILE" => config.backup_file = Some(PathBuf::from(value)),
                "SSH_HOST" => ssh.host = Some(value),
                "SSH_PORT" => ssh.port = Some(parse_port(name, &value)?),
                "SSH_USERNAME" => ssh.username = Some(value),
                "SSH_PASSWORD" => ssh.password = Some(value),
                "SSH_KEY_FILE" => ssh.key_file = Some(PathBuf::from(value)),
                "SSH_KEY_PASSPHRASE" => ssh.passphrase = Some(value),
                "LOG" => {}
                other => tracing::debug!(variable = other, "Ignoring unknown setting"),
            }
        }

        config.tunnel = ssh.into_tunnel(&config.params)?;
        Ok(config)
    }

    /// Builder preloaded with these options.
    pub fn into_builder(self) -> DatabaseBuilder {
        let mut builder = DatabaseBuilder::new()
            .params(self.params)
            .db_has_tz(self.db_has_tz)
            .reflect(self.reflect)
            .recreate_schema(self.recreate_schema)
            .schema(self.schema);
        if let Some(uri) = self.uri {
            builder = builder.uri(uri);
        }
        if let Some(path) = self.backup_file {
            builder = builder.backup_file(path);
        }
        if let Some(tunnel) = self.tunnel {
            builder = builder.tunnel(tunnel);
        }
        builder
    }
}

#[derive(Default)]
struct SshVars {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    key_file: Option<PathBuf>,
    passphrase: Option<String>,
}

impl SshVars {
    fn into_tunnel(self, params: &ConnectionSpec) -> DbResult<Option<TunnelConfig>> {
        let Some(host) = self.host else {
            return Ok(None);
        };
        let username = self
            .username
            .ok_or_else(|| DbBootError::config("DBBOOT_SSH_USERNAME is required with DBBOOT_SSH_HOST"))?;
        let remote_host = params.host.clone().unwrap_or_else(|| "localhost".to_string());
        let remote_port = params.port.unwrap_or(DEFAULT_POSTGRES_PORT);

        let mut tunnel = TunnelConfig::new(host, username, remote_host, remote_port);
        if let Some(port) = self.port {
            tunnel = tunnel.with_ssh_port(port);
        }
        tunnel = match (self.password, self.key_file) {
            (_, Some(path)) => tunnel.with_key(path, self.passphrase),
            (Some(password), None) => tunnel.with_password(password),
            (None, None) => tunnel.with_agent(),
        };
        Ok(Some(tunnel))
    }
}

fn parse_port(name: &str, value: &str) -> DbResult<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| DbBootError::config(format!("{ENV_PREFIX}{name} is not a valid port: {value:?}")))
}

fn parse_flag(name: &str, value: &str) -> DbResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(DbBootError::config(format!("{ENV_PREFIX}{name} is not a boolean: {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshAuthMethod;

    #[test]
    fn test_json_with_string_port() {
        let config = DatabaseConfig::from_json_str(
            r#"{
                "database": "mydatabase",
                "host": "myserver",
                "port": "1234",
                "username": "myuser",
                "password": "mypass",
                "recreateSchema": true,
                "backupFile": "tests/fixtures/db.pg_restore"
            }"#,
        )
        .unwrap();

        assert_eq!(config.params.port, Some(1234));
        assert_eq!(config.params.dialect, "postgresql");
        assert!(config.recreate_schema);
        assert!(!config.reflect);
        assert_eq!(config.schema, "public");
        assert_eq!(config.backup_file, Some(PathBuf::from("tests/fixtures/db.pg_restore")));
    }

    #[test]
    fn test_json_rejects_bad_port() {
        let err = DatabaseConfig::from_json_str(r#"{"database": "db", "port": "x"}"#).unwrap_err();
        assert_eq!(err.category(), "Config");
    }

    #[test]
    fn test_env_vars_with_tunnel() {
        let config = DatabaseConfig::from_vars([
            ("DBBOOT_DATABASE", "mydatabase"),
            ("DBBOOT_HOST", "db.internal"),
            ("DBBOOT_USERNAME", "myuser"),
            ("DBBOOT_DB_HAS_TZ", "true"),
            ("DBBOOT_SSH_HOST", "bastion"),
            ("DBBOOT_SSH_USERNAME", "jump"),
            ("DBBOOT_SSH_PASSWORD", "secret"),
            ("HOME", "/root"),
        ])
        .unwrap();

        assert!(config.db_has_tz);
        let tunnel = config.tunnel.unwrap();
        assert_eq!(tunnel.ssh_host, "bastion");
        assert_eq!(tunnel.ssh_port, 22);
        assert_eq!(tunnel.remote_host, "db.internal");
        assert_eq!(tunnel.remote_port, 5432);
        assert!(matches!(tunnel.auth, SshAuthMethod::Password { .. }));
    }

    #[test]
    fn test_env_vars_validation() {
        assert!(DatabaseConfig::from_vars([("DBBOOT_PORT", "99999")]).is_err());
        assert!(DatabaseConfig::from_vars([("DBBOOT_REFLECT", "maybe")]).is_err());
        assert!(DatabaseConfig::from_vars([("DBBOOT_SSH_HOST", "bastion")]).is_err());
        assert_eq!(DatabaseConfig::from_vars(Vec::<(String, String)>::new()).unwrap(), DatabaseConfig::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbboot.json");
        std::fs::write(&path, r#"{"uri": "sqlite:///tmp/x.db", "reflect": true}"#).unwrap();

        let config = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(config.uri.as_deref(), Some("sqlite:///tmp/x.db"));
        assert!(config.reflect);

        assert!(DatabaseConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
