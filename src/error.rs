/// Error taxonomy for the photo cache
///
/// Failures that fan out through shared background tasks have to reach every
/// waiter, so the enum is `Clone` and carries rendered messages rather than
/// source error values.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The file is not a pyramid file (or a different version). Triggers
    /// regeneration, never fatal.
    #[error("not a pyramid file: {0}")]
    Format(String),

    /// A pyramid with zero tiles was queried. Programmer error.
    #[error("pyramid has no tiles")]
    EmptyPyramid,

    /// The photo could not be read at generation time. Retryable later.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A record store or cache file write failed. Not auto-retried.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The source already carries a cache id.
    #[error("source already registered with cache id {0}")]
    AlreadyRegistered(i64),

    /// The source has no cache id yet; register it first.
    #[error("source is not registered")]
    UnregisteredSource,

    /// No factory is installed for the persisted source kind. The source is
    /// pinned unavailable; other sources keep starting.
    #[error("no implementation available for source kind {0:?}")]
    SourceTypeUnavailable(String),

    /// Plain I/O failure, distinct from `Format`.
    #[error("i/o error: {0}")]
    Io(String),

    /// The request was cancelled before it produced a result.
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(err: impl std::fmt::Display) -> Self {
        Error::Io(err.to_string())
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        Error::Persistence(err.to_string())
    }
}
