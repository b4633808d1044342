//! Failure taxonomy shared by every policy in a pipeline.
//!
//! Remote-call errors carry a [`FailureClass`] via the [`Classify`] trait.
//! Retry and the circuit breaker consult the same classification, so a
//! failure is either retried *and* counted toward the failure ratio, or
//! neither.

use std::time::Duration;
use thiserror::Error;

/// How a failure should be treated by the resilience policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Likely temporary (network fault, 5xx-class response). Eligible for
    /// retry and counted by the circuit breaker.
    Transient,
    /// Caller-side or validation fault. Propagates immediately, never
    /// counted against the circuit.
    NonTransient,
    /// The call was abandoned. Never retried, never counted, never masked
    /// by the fallback sentinel.
    Cancelled,
}

/// Classification hook implemented by the caller's remote-call error type.
///
/// The registry applies the same classifier to retry decisions and circuit
/// breaker sampling; implementations should map 5xx-style and socket-level
/// failures to [`FailureClass::Transient`] and 4xx-style faults to
/// [`FailureClass::NonTransient`].
pub trait Classify: std::error::Error {
    fn class(&self) -> FailureClass;
}

/// Unified failure type produced by a policy pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError<E> {
    /// The attempt exceeded the per-attempt deadline.
    #[error("operation timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout {
        /// Wall-clock time spent before the deadline fired.
        elapsed: Duration,
        /// Configured per-attempt ceiling.
        timeout: Duration,
    },
    /// The circuit breaker rejected the call without invoking it.
    #[error("circuit open for {open_for:?} ({failures}/{calls} failures in window)")]
    CircuitOpen {
        /// Transient failures in the rolling window when the circuit opened.
        failures: usize,
        /// Total samples in the rolling window when the circuit opened.
        calls: usize,
        /// Time the circuit has been open so far.
        open_for: Duration,
    },
    /// The caller cancelled the logical call.
    #[error("call cancelled")]
    Cancelled,
    /// The remote call itself failed.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E: Classify> PipelineError<E> {
    /// Classification of this failure as seen by the enclosing policies.
    ///
    /// `Timeout` and `CircuitOpen` are deliberately treated as transient:
    /// a circuit-open rejection consumes a retry slot, so the retry
    /// schedule naturally waits out part of the cooldown.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout { .. } | Self::CircuitOpen { .. } => FailureClass::Transient,
            Self::Cancelled => FailureClass::Cancelled,
            Self::Inner(e) => e.class(),
        }
    }
}

impl<E> PipelineError<E> {
    /// Check if this failure was raised by the timeout policy.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this failure was a circuit breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this failure wraps a remote-call error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the remote-call error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Extract the remote-call error if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, limit) if present.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}
