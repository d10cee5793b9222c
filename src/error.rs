//! Error types for compression and compressed-form operations

use thiserror::Error;

/// Errors surfaced by compression, kernels, and serialization.
///
/// No operation retries internally; every failure propagates to the caller
/// and leaves the matrix in its pre-call state.
#[derive(Debug, Error)]
pub enum ZipError {
    /// A structural invariant was violated (double compression, empty or
    /// invalid column indices, bad type tag on deserialization).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The requested operation is not implemented on the compressed form
    /// and has no decompression fallback.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Serialization read/write failure.
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    /// A task on the worker pool failed; the first failure is surfaced
    /// after all remaining tasks have joined.
    #[error("worker failure: {0}")]
    Worker(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ZipError>;
