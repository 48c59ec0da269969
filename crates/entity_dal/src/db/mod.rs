//! SQLite connection bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Parse connection strings handed to repositories by the host.
//! - Open and configure SQLite connections.
//! - Apply host-supplied schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - A connection is never handed to a context before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub mod migrations;
mod open;

pub use migrations::Migration;
pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    InvalidConnectionString(String),
    MigrationOrder {
        previous: u32,
        next: u32,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::InvalidConnectionString(value) => {
                write!(f, "invalid connection string `{value}`")
            }
            Self::MigrationOrder { previous, next } => write!(
                f,
                "migration version {next} must be greater than preceding version {previous}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::InvalidConnectionString(_) => None,
            Self::MigrationOrder { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Where a context connection points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Memory,
    File(PathBuf),
}

impl ConnectionTarget {
    /// Parses a connection string.
    ///
    /// Accepted forms: `:memory:` or `memory` for an in-memory database,
    /// `file:<path>` or a bare path for a file database.
    pub fn parse(connection: &str) -> DbResult<Self> {
        let trimmed = connection.trim();
        if trimmed.is_empty() {
            return Err(DbError::InvalidConnectionString(connection.to_string()));
        }

        if trimmed == ":memory:" || trimmed.eq_ignore_ascii_case("memory") {
            return Ok(Self::Memory);
        }

        let path = trimmed.strip_prefix("file:").unwrap_or(trimmed).trim();
        if path.is_empty() {
            return Err(DbError::InvalidConnectionString(connection.to_string()));
        }
        Ok(Self::File(PathBuf::from(path)))
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File(_) => "file",
        }
    }
}
