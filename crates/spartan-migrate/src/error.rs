//! Backend error types.

use thiserror::Error;

/// Errors raised by schema store and record store backends.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite driver error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transaction misuse (commit without begin, nested begin, ...).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Stored data could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Failure injected by a test backend.
    #[error("injected fault: {0}")]
    InjectedFault(String),
}
