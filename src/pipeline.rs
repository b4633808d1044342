//! Per-service composition of the four policies.
//!
//! Nesting is fixed, outermost first: Fallback → Retry → Timeout →
//! CircuitBreaker → remote call. Fallback sits outermost so it also
//! absorbs retry exhaustion, circuit-open rejections, and timeouts; retry
//! sits outside timeout and the breaker so every retried attempt gets a
//! fresh deadline and a fresh circuit evaluation.
//!
//! A pipeline is immutable once built and is invoked concurrently; the
//! only mutable state it touches is the circuit, which synchronizes
//! internally.

use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitState};
use crate::config::{ConfigError, ServicePolicyConfig};
use crate::error::{Classify, PipelineError};
use crate::fallback::{CallOutcome, FallbackPolicy};
use crate::observer::Observer;
use crate::retry::RetryPolicy;
use crate::time::{Clock, Sleeper};
use crate::timeout::TimeoutPolicy;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Compiled policy chain for one named service.
#[derive(Debug, Clone)]
pub struct PolicyPipeline {
    service: Arc<str>,
    base_address: String,
    fallback: FallbackPolicy,
    retry: RetryPolicy,
    timeout: TimeoutPolicy,
    breaker: CircuitBreakerPolicy,
}

impl PolicyPipeline {
    /// Compile a pipeline from a service config, validating it first.
    /// The circuit starts Closed and lives as long as the pipeline.
    pub fn new(
        service: &str,
        config: &ServicePolicyConfig,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let service: Arc<str> = service.into();
        Ok(Self {
            service: service.clone(),
            base_address: config.base_address.clone(),
            fallback: FallbackPolicy::new(
                service.clone(),
                config.fallback_enabled,
                observer.clone(),
            ),
            retry: RetryPolicy::new(service.clone(), config.retry_delays(), observer.clone()),
            timeout: TimeoutPolicy::new(service.clone(), config.timeout(), observer.clone()),
            breaker: CircuitBreakerPolicy::new(service, config, observer),
        })
    }

    /// Name of the service this pipeline guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Endpoint identifier for the transport layer; opaque to the policies.
    pub fn base_address(&self) -> &str {
        &self.base_address
    }

    /// Phase of this service's circuit.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Total attempts per call, including the initial one.
    pub fn max_attempts(&self) -> usize {
        self.retry.max_attempts()
    }

    /// Swap the retry sleeper; tests use this to skip real delays.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.retry = self.retry.with_sleeper(sleeper);
        self
    }

    /// Swap the circuit clock; tests use this to step through cooldowns.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.breaker = self.breaker.with_clock(clock);
        self
    }

    /// Run a remote call through the full policy chain.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        operation: Op,
    ) -> Result<CallOutcome<T>, PipelineError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_cancellable(&CancellationToken::new(), operation).await
    }

    /// Like [`execute`](Self::execute), but abandons the call when `cancel`
    /// fires: no further attempts, no circuit sample, no fallback sentinel,
    /// just `PipelineError::Cancelled`.
    pub async fn execute_cancellable<T, E, Fut, Op>(
        &self,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<CallOutcome<T>, PipelineError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // The operation is shared across retry attempts; the mutex is held
        // only while constructing an attempt's future, never across awaits.
        let operation = Arc::new(Mutex::new(operation));

        self.fallback
            .execute(self.retry.execute(cancel, || {
                let operation = operation.clone();
                let timeout = self.timeout.clone();
                let breaker = self.breaker.clone();
                async move {
                    timeout
                        .execute(|| {
                            let operation = operation.clone();
                            async move {
                                breaker
                                    .execute(|| {
                                        let mut operation =
                                            operation.lock().expect("operation mutex poisoned");
                                        (*operation)()
                                    })
                                    .await
                            }
                        })
                        .await
                }
            }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::observer::{MemoryObserver, NullObserver, PolicyEvent};
    use crate::time::{InstantSleeper, TrackingSleeper};
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct TestError {
        class: FailureClass,
    }

    impl TestError {
        fn transient() -> Self {
            Self { class: FailureClass::Transient }
        }
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    impl Classify for TestError {
        fn class(&self) -> FailureClass {
            self.class
        }
    }

    fn config() -> ServicePolicyConfig {
        ServicePolicyConfig {
            base_address: "https://svc.internal".into(),
            timeout_ms: 200,
            retry_interval_ms: vec![10, 10],
            circuit_breaker_failure_threshold: 0.5,
            circuit_breaker_sampling_duration_ms: 10_000,
            circuit_breaker_duration_ms: 5_000,
            minimum_throughput: 10,
            fallback_enabled: true,
        }
    }

    fn pipeline(config: &ServicePolicyConfig) -> PolicyPipeline {
        PolicyPipeline::new("svc", config, Arc::new(NullObserver))
            .expect("valid config")
            .with_sleeper(InstantSleeper)
    }

    #[tokio::test]
    async fn success_passes_straight_through() {
        let outcome = pipeline(&config())
            .execute(|| async { Ok::<_, TestError>("payload") })
            .await
            .unwrap();
        assert_eq!(outcome.ok(), Some("payload"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_build_time() {
        let mut bad = config();
        bad.timeout_ms = 0;
        let err = PolicyPipeline::new("svc", &bad, Arc::new(NullObserver));
        assert!(matches!(err, Err(ConfigError::ZeroTimeout)));
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retries_then_fall_back() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let outcome = pipeline(&config())
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::transient())
                }
            })
            .await
            .unwrap();

        assert!(outcome.is_fallback());
        assert_eq!(attempts.load(Ordering::SeqCst), 3, "one initial attempt plus two retries");
    }

    #[tokio::test]
    async fn non_transient_failures_fall_back_without_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let sleeper = TrackingSleeper::new();

        let outcome = PolicyPipeline::new("svc", &config(), Arc::new(NullObserver))
            .unwrap()
            .with_sleeper(sleeper.clone())
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError { class: FailureClass::NonTransient })
                }
            })
            .await
            .unwrap();

        assert!(outcome.is_fallback());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty(), "no retry wait for non-transient failures");
    }

    #[tokio::test]
    async fn each_attempt_gets_a_fresh_deadline() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let observer = MemoryObserver::new();

        let outcome = PolicyPipeline::new("svc", &config(), Arc::new(observer.clone()))
            .unwrap()
            .with_sleeper(InstantSleeper)
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, TestError>(())
                }
            })
            .await
            .unwrap();

        assert!(outcome.is_fallback());
        assert_eq!(attempts.load(Ordering::SeqCst), 3, "every attempt was admitted and timed out");
        let timeouts = observer
            .events_for("svc")
            .into_iter()
            .filter(|e| matches!(e, PolicyEvent::Timeout { .. }))
            .count();
        assert_eq!(timeouts, 3);
    }

    #[tokio::test]
    async fn cancellation_mid_retry_surfaces_cancelled_not_the_sentinel() {
        let pipeline = PolicyPipeline::new(
            "svc",
            &ServicePolicyConfig { retry_interval_ms: vec![200, 200], ..config() },
            Arc::new(NullObserver),
        )
        .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = pipeline
            .execute_cancellable(&token, || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::transient())
                }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn opted_out_service_surfaces_the_typed_failure() {
        let outcome = pipeline(&ServicePolicyConfig { fallback_enabled: false, ..config() })
            .execute(|| async { Err::<(), _>(TestError::transient()) })
            .await;
        assert!(outcome.unwrap_err().is_inner());
    }

    #[tokio::test]
    async fn exposes_service_metadata() {
        let pipeline = pipeline(&config());
        assert_eq!(pipeline.service(), "svc");
        assert_eq!(pipeline.base_address(), "https://svc.internal");
        assert_eq!(pipeline.max_attempts(), 3);
        assert_eq!(pipeline.circuit_state(), CircuitState::Closed);
    }
}
