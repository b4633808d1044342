//! Outermost policy: substitute a degraded sentinel for any failure.
//!
//! The fallback absorbs everything the inner layers surface (inner call
//! errors, timeout, circuit-open) except cancellation, which is not a
//! failure to mask. Services can opt out, in which case the typed failure
//! reaches the caller instead.

use crate::error::{Classify, FailureClass, PipelineError};
use crate::observer::{Observer, PolicyEvent};
use std::future::Future;
use std::sync::Arc;

/// Final outcome of a call through a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome<T> {
    /// A real response from the dependency.
    Ok(T),
    /// Degraded sentinel: the dependency is unavailable and every
    /// resilience layer was exhausted.
    Fallback,
}

impl<T> CallOutcome<T> {
    /// True if this is the degraded sentinel.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }

    /// The real response, if there was one.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Fallback => None,
        }
    }

    /// Borrow the real response, if there was one.
    pub fn as_ok(&self) -> Option<&T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Fallback => None,
        }
    }
}

/// Converts failures surfacing from the wrapped pipeline into
/// [`CallOutcome::Fallback`].
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    service: Arc<str>,
    enabled: bool,
    observer: Arc<dyn Observer>,
}

impl FallbackPolicy {
    pub fn new(service: Arc<str>, enabled: bool, observer: Arc<dyn Observer>) -> Self {
        Self { service, enabled, observer }
    }

    /// Await the wrapped pipeline and absorb its failure, if any.
    pub async fn execute<T, E, Fut>(&self, inner: Fut) -> Result<CallOutcome<T>, PipelineError<E>>
    where
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
    {
        match inner.await {
            Ok(value) => Ok(CallOutcome::Ok(value)),
            Err(failure) => {
                if failure.class() == FailureClass::Cancelled {
                    return Err(failure);
                }
                if !self.enabled {
                    return Err(failure);
                }
                self.observer.on_event(&self.service, &PolicyEvent::Fallback);
                Ok(CallOutcome::Fallback)
            }
        }
    }
}
