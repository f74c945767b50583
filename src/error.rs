//! Error types and handling for FlowStream
//!
//! Distinguishes per-element failures (which carry the input that was being
//! processed, so recovery handlers can retry or substitute) from pipeline
//! lifecycle signals such as cancellation.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error type produced by fallible stage functions.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// A captured per-element failure.
///
/// Carries the cause, the original input value that was being transformed
/// when the failure occurred, and the number of attempts made (more than one
/// when a retry policy was bound to the stage). Cheap to clone; immutable
/// once constructed.
#[derive(Clone)]
pub struct StageFailure {
    cause: Arc<dyn Error + Send + Sync>,
    input: Arc<dyn Any + Send + Sync>,
    attempts: u32,
}

impl StageFailure {
    pub fn new<I>(cause: Arc<dyn Error + Send + Sync>, input: I, attempts: u32) -> Self
    where
        I: Any + Send + Sync,
    {
        StageFailure {
            cause,
            input: Arc::new(input),
            attempts,
        }
    }

    /// The error that made the transformation fail.
    pub fn cause(&self) -> &(dyn Error + Send + Sync) {
        self.cause.as_ref()
    }

    /// Downcast the cause to a concrete error type.
    pub fn cause_ref<E: Error + 'static>(&self) -> Option<&E> {
        let cause: &(dyn Error + 'static) = self.cause.as_ref();
        cause.downcast_ref::<E>()
    }

    /// The input value that was being processed, if it has type `U`.
    pub fn input_ref<U: 'static>(&self) -> Option<&U> {
        self.input.downcast_ref::<U>()
    }

    /// Total attempts made before the failure became terminal.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage failed after {} attempt(s): {}",
            self.attempts, self.cause
        )
    }
}

impl fmt::Debug for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageFailure")
            .field("cause", &self.cause)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Error for StageFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let cause: &(dyn Error + 'static) = self.cause.as_ref();
        Some(cause)
    }
}

/// Main error type for pipeline operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    /// A transformation failed for one specific element.
    #[error("{0}")]
    Element(#[from] StageFailure),
    /// The pipeline was cancelled before the element could be processed.
    #[error("pipeline cancelled")]
    Cancelled,
    /// The bridge queue was closed while the operation was in flight.
    #[error("queue is closed")]
    Closed,
}

/// Error used when a stage function panics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage panicked: {0}")]
pub struct Panicked(pub String);

/// Retry policy for failing stage transformations.
///
/// Applied transparently by the executor binding: the same function is
/// re-run against the same input up to `max_retries` additional times before
/// the element resolves to a terminal failure.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// No retries
    None,
    /// Immediate retry up to max_retries
    Immediate { max_retries: usize },
    /// Fixed delay between retries
    Fixed { max_retries: usize, delay: Duration },
    /// Exponential backoff
    Exponential {
        max_retries: usize,
        initial_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed {
            max_retries: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Number of retries granted after the first attempt.
    pub fn max_retries(&self) -> usize {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Immediate { max_retries } => *max_retries,
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: usize) -> Duration {
        match self {
            RetryPolicy::None | RetryPolicy::Immediate { .. } => Duration::ZERO,
            RetryPolicy::Fixed { delay, .. } => *delay,
            RetryPolicy::Exponential {
                initial_delay,
                multiplier,
                ..
            } => initial_delay.mul_f64(multiplier.powi(attempt.saturating_sub(1) as i32)),
        }
    }
}
