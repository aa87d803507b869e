//! Error types for provisioning, catalog and cleanup failures.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while provisioning servers, templates and clones.
///
/// Variants are grouped by where the failure happened: the server control
/// utilities, a SQL statement against the catalog, a caller-supplied
/// migration, or scope cleanup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A server control binary (`initdb`, `pg_ctl`) could not be located.
    #[error("PostgreSQL binary '{name}' not found (set bin_dir or PGTESTDB_BIN_DIR)")]
    BinaryNotFound {
        /// Name of the missing binary
        name: String,
    },

    /// A server control command could not be spawned at all.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// Rendered command line
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A server control command ran but exited unsuccessfully.
    #[error("`{command}` exited with status {status:?}: {detail}")]
    CommandFailed {
        /// Rendered command line
        command: String,
        /// Exit code, if the process was not killed by a signal
        status: Option<i32>,
        /// Captured stderr, or the tail of the server log
        detail: String,
    },

    /// Filesystem work around the data directory failed.
    #[error("filesystem error at '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Opening a connection failed.
    #[error("failed to connect to {url}")]
    Connect {
        /// Connection URL with the password masked
        url: String,
        #[source]
        source: sqlx::Error,
    },

    /// A statement or query failed on an open connection.
    #[error("statement failed: {statement}")]
    Statement {
        /// SQL text with secrets masked
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    /// A database named like a template exists but was not built for it.
    ///
    /// Only unfinalized databases owned by the template's role are treated
    /// as leftovers of a failed build and rebuilt; anything else is left
    /// untouched.
    #[error(
        "database '{name}' exists but is not a template and is owned by '{owner}', not by role '{role}'"
    )]
    NameConflict {
        name: String,
        owner: String,
        role: String,
    },

    /// The caller-supplied migration for a template returned an error.
    #[error("migration for template '{template}' failed")]
    Migration {
        template: String,
        #[source]
        source: anyhow::Error,
    },

    /// A role or database name was rejected before reaching SQL.
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: &'static str },

    /// A connection URL could not be parsed into a server configuration.
    #[error("invalid connection url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A configuration value (e.g. from the environment) was malformed.
    #[error("invalid configuration value for {key}: {value}")]
    Config { key: &'static str, value: String },
}

impl Error {
    /// True for failures of the server control utilities.
    ///
    /// These are fatal for a test run: no database can be handed out.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Error::BinaryNotFound { .. }
                | Error::Spawn { .. }
                | Error::CommandFailed { .. }
                | Error::Io { .. }
        )
    }

    /// The server-reported SQLSTATE code, if this error came from a statement.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Error::Statement { source, .. } | Error::Connect { source, .. } => source
                .as_database_error()
                .and_then(|db| db.code())
                .map(|code| code.into_owned()),
            _ => None,
        }
    }
}
