//! shadowkv error types

use numr::dtype::DType;

/// shadowkv result type
pub type Result<T> = std::result::Result<T, Error>;

/// shadowkv errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Lifecycle ordering violated (decode before prefill, prefill twice,
    /// length overflow). The cache should be discarded or cleared.
    #[error("contract violation: {reason}")]
    ContractViolation {
        /// What was violated
        reason: String,
    },

    /// An input tensor's shape disagrees with the committed configuration
    #[error("shape mismatch for '{arg}': {reason}")]
    ShapeMismatch {
        /// Argument name
        arg: &'static str,
        /// Expected vs got
        reason: String,
    },

    /// Invalid argument to an operation or configuration field
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// DType unsupported by the requested operation
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Buffer or pinned host allocation failed at construction
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// What failed to allocate
        reason: String,
    },

    /// The truncated factorization did not converge.
    ///
    /// Recoverable: the affected layer falls back to dense resident mode.
    #[error("low-rank factorization did not converge: {reason}")]
    SvdNonConvergence {
        /// Sweep/threshold details
        reason: String,
    },

    /// CUDA kernel load or launch failure
    #[error("kernel error: {reason}")]
    KernelError {
        /// Description of what went wrong
        reason: String,
    },
}
