//! Error types for the bootstrap layer.
//!
//! Every fallible operation returns [`DbResult`]. Client library errors are
//! converted into [`DbBootError`] with their message, SQLSTATE code and source
//! preserved so callers can still tell an authentication failure from a
//! broken DDL statement.

use thiserror::Error;

/// Main error type for database bootstrap operations.
#[derive(Debug, Error)]
pub enum DbBootError {
    /// No usable engine, URI or connection parameters were supplied.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// The target could not be reached or the connection dropped.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server rejected the supplied credentials.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Statement execution failed on the server.
    #[error("Database error: {message}")]
    Database {
        /// Server error message.
        message: String,
        /// SQLSTATE code (e.g., "42P01").
        code: Option<String>,
        /// Additional detail from the server.
        detail: Option<String>,
        /// Server or generated hint.
        hint: Option<String>,
    },

    /// SSH tunnel setup or forwarding failed.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// An optional capability (tunnel, engine driver) was not compiled in.
    #[error("{capability} support is not available")]
    CapabilityUnavailable {
        /// Name of the missing capability.
        capability: &'static str,
        /// How to enable it.
        hint: String,
    },

    /// The external restore command failed.
    #[error("{command} failed. Return code: {}", exit_code_text(.exit_code))]
    Restore {
        /// Full command line that was run (without the password).
        command: String,
        /// Process exit code, `None` if it never ran or was killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Local SQLite engine error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Filesystem or process I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl DbBootError {
    // ========== Constructors ==========

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), hint: None, source: None }
    }

    /// Create a new connection error with hint.
    pub fn connection_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), hint: Some(hint.into()), source: None }
    }

    /// Create a new database error without server metadata.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into(), code: None, detail: None, hint: None }
    }

    /// Create a new SSH error.
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), hint: None }
    }

    /// Create a new SSH error with hint.
    pub fn ssh_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create an error for a capability that was compiled out.
    pub fn capability_unavailable(capability: &'static str, feature: &str) -> Self {
        Self::CapabilityUnavailable {
            capability,
            hint: format!("Rebuild dbboot_core with the `{feature}` feature enabled"),
        }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error means the target is not accepting connections yet.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Database { .. } => "Database",
            Self::Ssh { .. } => "SSH",
            Self::CapabilityUnavailable { .. } => "Capability",
            Self::Restore { .. } => "Restore",
            Self::Storage { .. } => "Storage",
            Self::Io(_) => "IO",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { .. } => {
                Some("Supply an engine, a connection URI, or at least a database name")
            }
            Self::Connection { hint, .. } => {
                hint.as_deref().or(Some("Check that the database server is running"))
            }
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Database { hint, .. } => hint.as_deref(),
            Self::Ssh { hint, .. } => hint.as_deref(),
            Self::CapabilityUnavailable { hint, .. } => Some(hint.as_str()),
            Self::Restore { .. } => Some("Check the backup file and that pg_restore is on PATH"),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Io(_) => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the SQLSTATE code (if applicable).
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error, keeping PostgreSQL metadata.
#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DbBootError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();
            return match code_str {
                "28P01" => DbBootError::Authentication {
                    message,
                    hint: Some("Invalid password - check your credentials".to_string()),
                },
                "28000" => DbBootError::Authentication {
                    message,
                    hint: Some(
                        "Authentication failed - check username and permissions".to_string(),
                    ),
                },
                // Class 08 and "cannot connect now" while the server starts up
                _ if code_str.starts_with("08") || code_str == "57P03" => {
                    DbBootError::Connection {
                        message,
                        hint: Some("The server is not accepting connections yet".to_string()),
                        source: Some(Box::new(err)),
                    }
                }
                _ => DbBootError::Database {
                    message,
                    code: Some(code_str.to_string()),
                    detail: db_err.detail().map(String::from),
                    hint: db_err.hint().map(String::from),
                },
            };
        }

        if err.is_closed() {
            return DbBootError::Connection {
                message: "Connection closed".to_string(),
                hint: None,
                source: Some(Box::new(err)),
            };
        }

        // Errors raised while parsing the connection string never reach the server
        // and are not worth retrying.
        let message = err.to_string();
        if message.starts_with("invalid configuration")
            || message.starts_with("invalid connection string")
        {
            return DbBootError::Config { message };
        }

        DbBootError::Connection { message, hint: None, source: Some(Box::new(err)) }
    }
}

/// Convert from rusqlite::Error to DbBootError.
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for DbBootError {
    fn from(err: rusqlite::Error) -> Self {
        let hint = match &err {
            rusqlite::Error::SqliteFailure(ffi_err, _) => match ffi_err.code {
                rusqlite::ffi::ErrorCode::DatabaseBusy => {
                    Some("The database is busy. Try again in a moment.")
                }
                rusqlite::ffi::ErrorCode::DatabaseLocked => {
                    Some("The database is locked. Close other processes using it.")
                }
                rusqlite::ffi::ErrorCode::CannotOpen => {
                    Some("Could not open the database file. Check the path and permissions.")
                }
                rusqlite::ffi::ErrorCode::ReadOnly => {
                    Some("Database is read-only. Check file permissions.")
                }
                rusqlite::ffi::ErrorCode::ConstraintViolation => {
                    Some("A constraint was violated. Check for duplicate keys.")
                }
                _ => None,
            },
            _ => None,
        };

        DbBootError::Storage {
            message: err.to_string(),
            hint: hint.map(String::from),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from url::ParseError to DbBootError.
impl From<url::ParseError> for DbBootError {
    fn from(err: url::ParseError) -> Self {
        DbBootError::Config { message: format!("Invalid connection URI: {err}") }
    }
}

/// Convert from serde_json::Error to DbBootError.
impl From<serde_json::Error> for DbBootError {
    fn from(err: serde_json::Error) -> Self {
        DbBootError::Config { message: format!("Invalid configuration file: {err}") }
    }
}

fn exit_code_text(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Type alias for Result with DbBootError.
pub type DbResult<T> = Result<T, DbBootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_error_message_includes_command_and_code() {
        let err = DbBootError::Restore {
            command: "pg_restore -c -d mydatabase test.pg_restore".to_string(),
            exit_code: Some(1),
            stderr: "could not open input file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "pg_restore -c -d mydatabase test.pg_restore failed. Return code: 1"
        );
        assert_eq!(err.category(), "Restore");
    }

    #[test]
    fn test_capability_unavailable_hint_names_feature() {
        let err = DbBootError::capability_unavailable("SSH tunnel", "ssh-tunnel");
        assert_eq!(err.to_string(), "SSH tunnel support is not available");
        assert!(err.hint().unwrap().contains("ssh-tunnel"));
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(DbBootError::connection("refused").is_unavailable());
        assert!(DbBootError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            .is_unavailable());
        assert!(!DbBootError::config("nothing supplied").is_unavailable());
        assert!(!DbBootError::Authentication { message: "bad".into(), hint: None }
            .is_unavailable());
    }
}
