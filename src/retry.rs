//! Retry policy driven by an explicit delay schedule.
//!
//! Semantics:
//! - Total attempts = 1 + `delays.len()`; `delays[i]` is the wait before
//!   attempt `i + 2`.
//! - Only failures classified [`FailureClass::Transient`] are retried.
//!   Timeout and circuit-open rejections classify as transient, so a
//!   rejected call consumes a retry slot against the cooldown.
//! - `NonTransient` and `Cancelled` failures propagate immediately without
//!   consuming a slot.
//! - When the schedule is exhausted, the last failure propagates unchanged.
//! - Cancellation is honored before each attempt and during each wait.

use crate::error::{Classify, FailureClass, PipelineError};
use crate::observer::{Observer, PolicyEvent};
use crate::time::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Re-executes failed calls according to a fixed delay schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    service: Arc<str>,
    delays: Arc<[Duration]>,
    sleeper: Arc<dyn Sleeper>,
    observer: Arc<dyn Observer>,
}

impl RetryPolicy {
    pub fn new(service: Arc<str>, delays: Vec<Duration>, observer: Arc<dyn Observer>) -> Self {
        Self { service, delays: delays.into(), sleeper: Arc::new(TokioSleeper), observer }
    }

    /// Swap the sleeper; tests use this to make delays instant or observable.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Total attempts this policy will make, including the initial call.
    pub fn max_attempts(&self) -> usize {
        1 + self.delays.len()
    }

    /// Run `operation`, retrying transient failures per the schedule.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        cancel: &CancellationToken,
        mut operation: Op,
    ) -> Result<T, PipelineError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut retries_used = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = operation() => result,
            };

            let failure = match result {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            match failure.class() {
                FailureClass::NonTransient | FailureClass::Cancelled => return Err(failure),
                FailureClass::Transient => {}
            }

            let Some(delay) = self.delays.get(retries_used).copied() else {
                // Schedule exhausted; the last failure propagates unchanged.
                return Err(failure);
            };
            retries_used += 1;

            self.observer
                .on_event(&self.service, &PolicyEvent::Retry { attempt: retries_used, delay });

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}
