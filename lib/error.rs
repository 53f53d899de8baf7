//! The shared error type for filesystem operations.
//!
//! Every layer between the wire client and the FUSE adapter speaks
//! [`FsError`]. The benign/malignant split that drives retry decisions
//! lives here, in one place, so the fault-tolerant wrappers and the write
//! path cannot drift apart in how they classify failures.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by filesystem and backend operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not exist on the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path already exists on the backend.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The backend stream has no more data.
    #[error("end of stream")]
    EndOfStream,

    /// Transport-level or backend-internal failure. Subject to retry.
    #[error("backend error: {0}")]
    Transport(String),

    /// A write would exceed the remaining capacity of the store.
    #[error("file too large for available capacity")]
    TooLarge,

    /// The operation is not supported by this filesystem.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// The pooled reader was closed while a read was in flight.
    #[error("reader closed")]
    ReaderClosed,

    /// An internal invariant was violated. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),

    /// Local staging-file I/O failure.
    #[error("staging i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Whether this error is expected during normal operation.
    ///
    /// Benign errors are propagated to the caller immediately and never
    /// trigger a client reset or a retry. Everything else is malignant and
    /// goes through the configured retry policy.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::EndOfStream
        )
    }
}
