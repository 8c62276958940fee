//! API-facing error taxonomy.
//!
//! Portal operations report failures synchronously using these kinds.
//! Internal protocol failures (malformed wire traffic, impossible peer
//! requests) are never surfaced here: they are recovered by dropping the
//! offending link and propagating route disconnection.

/// Result alias for portal-facing operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Misuse by the local caller, e.g. merging a router that already owns
    /// traffic, or committing against the wrong staged buffer.
    #[error("invalid argument")]
    InvalidArgument,

    /// Ordering violation by the local caller, e.g. commit without begin.
    #[error("failed precondition")]
    FailedPrecondition,

    /// The peer is gone and the operation requires it.
    #[error("peer not found")]
    NotFound,

    /// Nothing to receive yet; retry after the next arrival.
    #[error("unavailable")]
    Unavailable,

    /// A caller-provided buffer is too small; retry with a larger one.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The caller consumed more than was available.
    #[error("out of range")]
    OutOfRange,
}
