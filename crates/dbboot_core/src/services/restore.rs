//! Restore a database from a `pg_dump` custom-format archive with `pg_restore`.

use crate::error::{DbBootError, DbResult};
use crate::models::ConnectionSpec;
use crate::services::uri;
use std::path::Path;
use std::process::Command;

/// Runs the restore executable against a connection URI.
#[derive(Debug, Clone)]
pub struct Restorer {
    program: String,
}

impl Default for Restorer {
    fn default() -> Self {
        Self { program: "pg_restore".to_string() }
    }
}

impl Restorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different executable, e.g. a versioned `pg_restore` path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments passed to the executable. The password is never included.
    pub fn arguments(spec: &ConnectionSpec, backup_file: &Path) -> Vec<String> {
        let mut args = vec!["-c".to_string()];
        let options = [
            ("-d", spec.database.clone()),
            ("-h", spec.host.clone()),
            ("-p", spec.port.map(|p| p.to_string())),
            ("-U", spec.username.clone()),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }
        args.push(backup_file.display().to_string());
        args
    }

    /// Restore `backup_file` into the database behind `db_uri`.
    ///
    /// Returns the captured standard output; each line is also logged.
    pub fn restore(&self, db_uri: &str, backup_file: impl AsRef<Path>) -> DbResult<String> {
        let spec = uri::decode(db_uri, true)?;
        let args = Self::arguments(&spec, backup_file.as_ref());
        let command_line = format!("{} {}", self.program, args.join(" "));

        let mut command = Command::new(&self.program);
        command.args(&args);
        if let Some(password) = spec.password.as_deref() {
            command.env("PGPASSWORD", password);
        }

        tracing::info!(command = %command_line, "Restoring database");
        let output = command.output().map_err(|e| DbBootError::Restore {
            command: command_line.clone(),
            exit_code: None,
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            tracing::warn!(
                command = %command_line,
                exit_code = ?output.status.code(),
                stderr = %stderr.trim(),
                "Restore failed"
            );
            return Err(DbBootError::Restore {
                command: command_line,
                exit_code: output.status.code(),
                stderr,
            });
        }

        for line in stdout.lines() {
            tracing::info!("{line}");
        }
        Ok(stdout)
    }
}

/// Restore with the default `pg_restore` executable.
pub fn restore(db_uri: &str, backup_file: impl AsRef<Path>) -> DbResult<String> {
    Restorer::default().restore(db_uri, backup_file)
}
