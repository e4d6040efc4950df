use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Failure reported by a database backend.
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
    #[error("query returned no rows")]
    NoRows,
    #[error("column {index}: {reason}")]
    Column { index: usize, reason: String },
    #[error("{dialect} placeholders are not supported by {engine}")]
    UnsupportedDialect { engine: &'static str, dialect: String },
    #[error("database connection mutex poisoned")]
    Poisoned,
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for DbError {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned
    }
}

/// Failure while listing or reading migration scripts.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("migration {0} not found")]
    NotFound(String),
    #[error("invalid migration name {0}")]
    InvalidName(String),
}

/// A placeholder dialect name that could not be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown placeholder dialect {0:?}")]
pub struct UnknownDialect(pub String);

/// Why a lock wait ended before the lock was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The caller's cancellation token fired.
    Cancelled,
    /// The process received an interrupt, terminate or quit signal.
    Signal(&'static str),
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancellation requested"),
            Self::Signal(name) => write!(f, "received {name}"),
        }
    }
}

/// Error type for the schemalock crate.
///
/// Every variant that wraps a lower-level failure exposes it through
/// [`std::error::Error::source`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to ping database: {0}")]
    Connectivity(#[source] DbError),
    #[error("failed to create {table} table: {source}")]
    Bootstrap {
        table: String,
        #[source]
        source: DbError,
    },
    #[error("failed to identify lock owner: {0}")]
    LockOwner(#[source] std::io::Error),
    #[error("failed to start waiting for lock: {0}")]
    LockWait(#[source] std::io::Error),
    #[error("failed to acquire lock after {0:?}")]
    LockTimeout(Duration),
    #[error("aborting lock acquisition: {0}")]
    LockAborted(AbortCause),
    #[error("failed to query database history: {0}")]
    History(#[source] DbError),
    #[error("failed to read migrations: {0}")]
    Source(#[from] SourceError),
    #[error("{}", describe_mismatch(.recorded, .candidate))]
    HistoryMismatch {
        recorded: String,
        candidate: Option<String>,
    },
    #[error("checksum mismatch for migration {name}: recorded {recorded}, computed {computed}")]
    ChecksumMismatch {
        name: String,
        recorded: String,
        computed: String,
    },
    #[error("migration {name} failed: {source}")]
    MigrationExecution {
        name: String,
        #[source]
        source: DbError,
    },
    #[error("failed to save migration {name}: {source}")]
    LedgerWrite {
        name: String,
        #[source]
        source: DbError,
    },
    #[error("failed to free lock: {0}")]
    LockRelease(#[source] DbError),
}

fn describe_mismatch(recorded: &str, candidate: &Option<String>) -> String {
    match candidate {
        Some(candidate) => {
            format!("mismatch between history {recorded} and migration {candidate}")
        }
        None => format!("recorded migration {recorded} is missing from source"),
    }
}
