//! Per-attempt deadline enforcement.
//!
//! Built on `tokio::time::timeout`, which resolves the completion/deadline
//! race deterministically: whichever future is observed ready first wins,
//! and the loser is dropped. Dropping the inner future is the cancellation
//! signal; the policy does not wait for the abandoned attempt to unwind.

use crate::error::{Classify, PipelineError};
use crate::observer::{Observer, PolicyEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounds the wall-clock duration of a single attempt.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    service: Arc<str>,
    timeout: Duration,
    observer: Arc<dyn Observer>,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Panics if the duration is zero; registry
    /// construction validates configs before reaching this point.
    pub fn new(service: Arc<str>, timeout: Duration, observer: Arc<dyn Observer>) -> Self {
        assert!(timeout > Duration::ZERO, "timeout must be non-zero");
        Self { service, timeout, observer }
    }

    /// The configured per-attempt ceiling.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation` with a deadline, abandoning it on expiry.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PipelineError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                self.observer.on_event(&self.service, &PolicyEvent::Timeout { elapsed });
                Err(PipelineError::Timeout { elapsed, timeout: self.timeout })
            }
        }
    }
}
