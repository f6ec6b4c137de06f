//! Error types for the queue and pipeline layers.
//!
//! [`PipelineError`] follows the same `ErrorClassification` shape as
//! `pulsearc_common::error::CommonError` so that an embedding application's
//! existing retry/alerting middleware composes with this crate's errors the
//! same way it composes with that one, just with a surface trimmed down to
//! what a pipeline actually produces.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Error raised by the "unconditional intent" queue operations (`push`,
/// `value_pop`) when the queue is closed.
///
/// Status-returning operations (`try_push`, `nonblocking_pop`, ...) report
/// closure as a [`crate::queue::QueueStatus::Closed`] value instead of this
/// error; see [`crate::queue::BoundedQueue`] for the full split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue has been closed and the operation cannot proceed.
    #[error("bounded queue is closed")]
    Closed,
}

/// Error surface for pipeline construction and execution.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A `BoundedQueue` was constructed, or a stage was built around one,
    /// with a capacity of zero.
    #[error("queue capacity must be greater than zero")]
    InvalidCapacity,

    /// `Stage::parallel` or `Pipeline::parallel` was called with `k == 0`.
    #[error("stage parallelism must be at least 1")]
    InvalidParallelism,

    /// A queue operation performed as part of running the pipeline reported
    /// [`QueueError::Closed`].
    #[error("queue closed during pipeline execution: {0}")]
    Queue(#[from] QueueError),

    /// A stage function panicked while processing a value. The stage's
    /// worker group closes its downstream queue and exits; this is the
    /// terminal condition for that stage, not the whole process.
    #[error("stage '{stage}' failed: {message}")]
    StageFailure {
        /// Name of the stage that panicked, if one was assigned, else its
        /// position in the pipeline (`"stage[2]"`).
        stage: String,
        /// The panic payload, downcast to a displayable message where
        /// possible (`&str`/`String`), else a generic placeholder.
        message: String,
    },

    /// An engine-internal invariant was violated (for example a worker
    /// group's live-count underflowing). Should not occur in practice;
    /// reserved for conditions the engine itself can detect, as opposed to
    /// a panic inside caller-supplied code.
    #[error("internal pipeline error: {0}")]
    Internal(String),
}

/// Standard result type using [`PipelineError`].
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Classification of an error's retry and severity characteristics.
///
/// Implemented by [`PipelineError`] so callers can build uniform retry and
/// alerting logic without matching on every variant by hand.
pub trait ErrorClassification {
    /// Whether retrying the same operation might succeed.
    fn is_retryable(&self) -> bool;

    /// Severity level, for logging and alerting decisions.
    fn severity(&self) -> ErrorSeverity;

    /// Whether this error requires immediate attention.
    fn is_critical(&self) -> bool;

    /// Suggested delay before retrying, if any.
    fn retry_after(&self) -> Option<Duration>;
}

/// Severity levels for monitoring and alerting, ordered least to most
/// urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational; expected, not actionable on its own.
    Info,
    /// Degraded but operational.
    Warning,
    /// Failure requiring attention.
    Error,
    /// System integrity at risk; immediate action required.
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl ErrorClassification for PipelineError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Queue(QueueError::Closed))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::InvalidCapacity | Self::InvalidParallelism => ErrorSeverity::Error,
            Self::Queue(QueueError::Closed) => ErrorSeverity::Info,
            Self::StageFailure { .. } => ErrorSeverity::Error,
            Self::Internal(_) => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}
