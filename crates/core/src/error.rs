//! Error taxonomy for the Concourse storage engine (spec §7).
//!
//! `thiserror` derives `Display`/`std::error::Error`. Storage-layer I/O
//! errors propagate unchanged; the concurrency layer translates version
//! races into [`Error::Retry`]; validation errors are always surfaced.

use std::io;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the Concourse storage engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure (disk, file handles).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block, page, or WAL file failed a checksum or structural check.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// An `AtomicOperation` lost a version race during commit validation.
    /// Recovered by `executeWithRetry` (spec §4.5/§7).
    #[error("retry: {0}")]
    Retry(String),

    /// A staged `Transaction` was invalidated (version conflict or
    /// explicit abort) and must be finalized by the client.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// CCL or JSON input failed to parse, or an operator name was invalid.
    #[error("parse error: {0}")]
    Parse(String),

    /// `findOrAdd`/`findOrInsert` matched more than one record.
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// Invalid credentials or insufficient permission.
    #[error("security error: {0}")]
    Security(String),

    /// Self-link, value type mismatch, bad timestamp format, or similar
    /// caller error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// System ID mismatch, heap exhaustion, unreadable block file, disk
    /// full — aborts startup or refuses further work on the environment.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True for errors that `executeWithRetry` should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retry(_))
    }

    /// True for errors that must never be silently swallowed (spec §7:
    /// "Validation errors ... are always surfaced — never silently
    /// swallowed").
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::InvalidArgument(_) | Error::Parse(_))
    }

    /// True for unrecoverable errors that should abort startup or refuse
    /// further work on the environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_is_retryable() {
        assert!(Error::Retry("lost race".into()).is_retryable());
        assert!(!Error::Fatal("disk full".into()).is_retryable());
    }

    #[test]
    fn invalid_argument_is_validation() {
        assert!(Error::InvalidArgument("self link".into()).is_validation_error());
        assert!(!Error::Retry("x".into()).is_validation_error());
    }
}
