//! Crate-wide error type.
//!
//! Every fallible operation in the runtime reports one of these variants
//! instead of touching memory it does not own. Floating-point edge cases
//! (division by zero, overflow, NaN) are *not* errors; they follow IEEE-754.

/// All errors the numeric runtime can report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    /// The allocator could not provide a buffer of the requested size.
    #[error("allocation of {elements} elements failed")]
    AllocationFailed { elements: usize },

    /// An argument was rejected before any work was done.
    #[error("invalid argument to {op}: {why}")]
    InvalidArgument { op: &'static str, why: String },

    /// A buffer is shorter than the element count the caller asked for.
    #[error("{op}: needs {needed} elements, buffer holds {available}")]
    LengthMismatch {
        op: &'static str,
        needed: usize,
        available: usize,
    },

    /// Two shaped tensors do not agree.
    #[error("{op}: shape mismatch, expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A flat or multi-dimensional index is outside the tensor.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A node handle does not belong to the graph it was used with, or its
    /// recording session has already ended.
    #[error("invalid handle {handle:#x}")]
    InvalidHandle { handle: u64 },

    /// A graph operation needs an active recording session.
    #[error("{op} requires an active recording session")]
    NoActiveSession { op: &'static str },

    /// A parallel worker's body failed.
    #[error("worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },

    /// A dedicated worker pool could not be started.
    #[error("executor unavailable: {why}")]
    ExecutorUnavailable { why: String },

    /// Every graph id up to `max` has been handed out.
    #[error("graph ids exhausted after {max} graphs")]
    GraphIdsExhausted { max: u32 },
}

impl RuntimeError {
    /// Shorthand for [`RuntimeError::InvalidArgument`].
    pub fn invalid(op: &'static str, why: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            why: why.into(),
        }
    }

    /// Stable non-zero code reported across the native boundary.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::AllocationFailed { .. } => 1,
            Self::InvalidArgument { .. } => 2,
            Self::LengthMismatch { .. } => 3,
            Self::ShapeMismatch { .. } => 4,
            Self::IndexOutOfBounds { .. } => 5,
            Self::InvalidHandle { .. } => 6,
            Self::NoActiveSession { .. } => 7,
            Self::WorkerFailed { .. } => 8,
            Self::ExecutorUnavailable { .. } => 9,
            Self::GraphIdsExhausted { .. } => 10,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = RuntimeError> = core::result::Result<T, E>;
