//! Rolling-window circuit breaker.
//!
//! One instance guards one service. The circuit trips when, within the
//! sampling window, at least `minimum_throughput` calls were observed and
//! the transient-failure ratio reached the configured threshold. After
//! `break_duration` open, a single exclusive probe decides whether traffic
//! resumes.
//!
//! Classification rules match the retry policy: only transient failures
//! count toward the ratio. Non-transient and cancelled outcomes pass
//! through unrecorded, and an attempt abandoned mid-flight (deadline or
//! caller cancellation dropped the future) contributes no sample; if it
//! held the probe slot, a drop guard releases it.
//!
//! All state lives behind one mutex with short critical sections, making
//! phase transitions linearizable under concurrent call volume.

use crate::config::ServicePolicyConfig;
use crate::error::{Classify, FailureClass, PipelineError};
use crate::observer::{Observer, PolicyEvent};
use crate::time::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Phase of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; outcomes feed the rolling window.
    Closed,
    /// Calls are rejected without dialing until the cooldown elapses.
    Open,
    /// Cooldown elapsed; one probe call at a time is admitted.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at_millis: u64,
    success: bool,
}

#[derive(Debug)]
struct CircuitInner {
    phase: CircuitState,
    window: VecDeque<Sample>,
    opened_at_millis: u64,
    probe_in_flight: bool,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            phase: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at_millis: 0,
            probe_in_flight: false,
        }
    }

    /// Drop samples older than the sampling window.
    fn prune(&mut self, now_millis: u64, sampling_ms: u64) {
        let horizon = now_millis.saturating_sub(sampling_ms);
        while self.window.front().is_some_and(|s| s.at_millis < horizon) {
            self.window.pop_front();
        }
    }

    fn counts(&self) -> (usize, usize) {
        let failures = self.window.iter().filter(|s| !s.success).count();
        (failures, self.window.len())
    }

    fn rejection(&self, open_for_millis: u64) -> Rejection {
        let (failures, calls) = self.counts();
        Rejection { failures, calls, open_for: Duration::from_millis(open_for_millis) }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rejection {
    failures: usize,
    calls: usize,
    open_for: Duration,
}

#[derive(Debug, Clone)]
struct BreakerSettings {
    failure_threshold: f64,
    sampling_ms: u64,
    break_ms: u64,
    minimum_throughput: usize,
}

/// Releases the exclusive probe slot if the guarded attempt is dropped
/// before its outcome was recorded.
struct ProbeGuard {
    inner: Option<Arc<Mutex<CircuitInner>>>,
}

impl ProbeGuard {
    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut inner = inner.lock().expect("circuit state poisoned");
            inner.probe_in_flight = false;
        }
    }
}

/// Stateful gate that stops forwarding calls to a failing dependency.
///
/// Clones share the same circuit: all handles observe and affect one
/// phase/window lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    service: Arc<str>,
    settings: BreakerSettings,
    inner: Arc<Mutex<CircuitInner>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
}

impl CircuitBreakerPolicy {
    /// Build a breaker from a validated service config, starting Closed.
    pub fn new(
        service: Arc<str>,
        config: &ServicePolicyConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            service,
            settings: BreakerSettings {
                failure_threshold: config.circuit_breaker_failure_threshold,
                sampling_ms: config.circuit_breaker_sampling_duration_ms,
                break_ms: config.circuit_breaker_duration_ms,
                minimum_throughput: config.minimum_throughput,
            },
            inner: Arc::new(Mutex::new(CircuitInner::new())),
            clock: Arc::new(MonotonicClock::default()),
            observer,
        }
    }

    /// Override the clock; tests use this to step through the cooldown.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current phase, as last recorded. An Open circuit whose cooldown has
    /// elapsed still reports Open until a call probes it.
    pub fn state(&self) -> CircuitState {
        self.lock().phase
    }

    /// Run `operation` under circuit protection.
    ///
    /// Returns `PipelineError::CircuitOpen` without invoking the operation
    /// when the circuit is open or another probe holds the half-open slot.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PipelineError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(rejection) => {
                return Err(PipelineError::CircuitOpen {
                    failures: rejection.failures,
                    calls: rejection.calls,
                    open_for: rejection.open_for,
                })
            }
        };

        let mut guard = ProbeGuard {
            inner: (admission == Admission::Probe).then(|| self.inner.clone()),
        };

        let result = operation().await;
        guard.disarm();

        match &result {
            Ok(_) => self.record_success(admission),
            Err(e) => self.record_failure(admission, e.class()),
        }

        result.map_err(PipelineError::Inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().expect("circuit state poisoned")
    }

    fn admit(&self) -> Result<Admission, Rejection> {
        let now = self.clock.now_millis();
        let mut event = None;

        let decision = {
            let mut inner = self.lock();
            inner.prune(now, self.settings.sampling_ms);
            match inner.phase {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::Open => {
                    let elapsed = now.saturating_sub(inner.opened_at_millis);
                    if elapsed >= self.settings.break_ms {
                        inner.phase = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        event = Some(PolicyEvent::CircuitHalfOpen);
                        Ok(Admission::Probe)
                    } else {
                        Err(inner.rejection(elapsed))
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        let elapsed = now.saturating_sub(inner.opened_at_millis);
                        Err(inner.rejection(elapsed))
                    } else {
                        inner.probe_in_flight = true;
                        event = Some(PolicyEvent::CircuitHalfOpen);
                        Ok(Admission::Probe)
                    }
                }
            }
        };

        if let Some(event) = event {
            self.observer.on_event(&self.service, &event);
        }
        decision
    }

    fn record_success(&self, admission: Admission) {
        let now = self.clock.now_millis();
        let mut event = None;
        {
            let mut inner = self.lock();
            match admission {
                Admission::Probe => {
                    if inner.phase == CircuitState::HalfOpen {
                        inner.phase = CircuitState::Closed;
                        inner.window.clear();
                        inner.opened_at_millis = 0;
                        event = Some(PolicyEvent::CircuitClosed);
                    }
                    inner.probe_in_flight = false;
                }
                Admission::Normal => {
                    // Outcomes that land after the circuit opened are stale;
                    // only record while closed.
                    if inner.phase == CircuitState::Closed {
                        inner.window.push_back(Sample { at_millis: now, success: true });
                        inner.prune(now, self.settings.sampling_ms);
                    }
                }
            }
        }
        if let Some(event) = event {
            self.observer.on_event(&self.service, &event);
        }
    }

    fn record_failure(&self, admission: Admission, class: FailureClass) {
        match class {
            FailureClass::Transient => {}
            FailureClass::NonTransient | FailureClass::Cancelled => {
                // Not the dependency's fault; the circuit stays undecided.
                if admission == Admission::Probe {
                    self.lock().probe_in_flight = false;
                }
                return;
            }
        }

        let now = self.clock.now_millis();
        let mut event = None;
        {
            let mut inner = self.lock();
            match admission {
                Admission::Probe => {
                    if inner.phase == CircuitState::HalfOpen {
                        inner.phase = CircuitState::Open;
                        inner.opened_at_millis = now;
                        let (failures, calls) = inner.counts();
                        event = Some(PolicyEvent::CircuitOpened { failures, calls });
                    }
                    inner.probe_in_flight = false;
                }
                Admission::Normal => {
                    if inner.phase == CircuitState::Closed {
                        inner.window.push_back(Sample { at_millis: now, success: false });
                        inner.prune(now, self.settings.sampling_ms);
                        let (failures, calls) = inner.counts();
                        if calls >= self.settings.minimum_throughput
                            && failures as f64 / calls as f64 >= self.settings.failure_threshold
                        {
                            inner.phase = CircuitState::Open;
                            inner.opened_at_millis = now;
                            event = Some(PolicyEvent::CircuitOpened { failures, calls });
                        }
                    }
                }
            }
        }
        if let Some(event) = event {
            self.observer.on_event(&self.service, &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::MemoryObserver;
    use crate::time::ManualClock;
    use futures::future::join_all;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct TestError {
        class: FailureClass,
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

    fn transient() -> TestError {
        TestError { class: FailureClass::Transient }
    }

    fn config() -> ServicePolicyConfig {
        ServicePolicyConfig {
            base_address: "https://svc.internal".into(),
            timeout_ms: 1000,
            retry_interval_ms: vec![],
            circuit_breaker_failure_threshold: 0.5,
            circuit_breaker_sampling_duration_ms: 10_000,
            circuit_breaker_duration_ms: 5_000,
            minimum_throughput: 10,
            fallback_enabled: true,
        }
    }

    fn breaker(config: &ServicePolicyConfig, clock: ManualClock) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::new("svc".into(), config, Arc::new(crate::observer::NullObserver))
            .with_clock(clock)
    }

    async fn fail(breaker: &CircuitBreakerPolicy) -> Result<(), PipelineError<TestError>> {
        breaker.execute(|| async { Err::<(), _>(transient()) }).await
    }

    async fn succeed(breaker: &CircuitBreakerPolicy) -> Result<(), PipelineError<TestError>> {
        breaker.execute(|| async { Ok::<_, TestError>(()) }).await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls_through() {
        let breaker = breaker(&config(), ManualClock::new());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn opens_once_ratio_and_throughput_are_met() {
        let breaker = breaker(&config(), ManualClock::new());

        for _ in 0..9 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Closed, "below minimum throughput");
        }
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open, "10th failure trips the circuit");
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_invoking() {
        let breaker = breaker(&config(), ManualClock::new());
        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();
        let result = breaker
            .execute(|| {
                let invoked = invoked_clone.clone();
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ratio_below_threshold_keeps_the_circuit_closed() {
        let breaker = breaker(&config(), ManualClock::new());

        // 4 failures / 10 calls = 0.4, below the 0.5 threshold.
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        for _ in 0..6 {
            let _ = succeed(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn non_transient_failures_do_not_count() {
        let breaker = breaker(&config(), ManualClock::new());

        for _ in 0..20 {
            let result = breaker
                .execute(|| async {
                    Err::<(), _>(TestError { class: FailureClass::NonTransient })
                })
                .await;
            assert!(result.unwrap_err().is_inner(), "non-transient failures pass through");
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn samples_expire_out_of_the_window() {
        let clock = ManualClock::new();
        let breaker = breaker(&config(), clock.clone());

        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        // Sampling window is 10s; push the old failures out of it.
        clock.advance(Duration::from_millis(10_001));
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed, "never 10 samples in one window");
    }

    #[tokio::test]
    async fn cooldown_admits_a_probe_and_success_closes() {
        let clock = ManualClock::new();
        let observer = MemoryObserver::new();
        let breaker = CircuitBreakerPolicy::new("svc".into(), &config(), Arc::new(observer.clone()))
            .with_clock(clock.clone());

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(fail(&breaker).await.unwrap_err().is_circuit_open());

        clock.advance(Duration::from_millis(5_000));
        assert!(succeed(&breaker).await.is_ok(), "probe admitted after cooldown");
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Window was reset on close: old failures are gone.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let events = observer.events_for("svc");
        assert!(events.contains(&PolicyEvent::CircuitOpened { failures: 10, calls: 10 }));
        assert!(events.contains(&PolicyEvent::CircuitHalfOpen));
        assert!(events.contains(&PolicyEvent::CircuitClosed));
    }

    #[tokio::test]
    async fn failed_probe_reopens_and_restarts_the_cooldown() {
        let clock = ManualClock::new();
        let breaker = breaker(&config(), clock.clone());

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(5_000));
        assert!(fail(&breaker).await.unwrap_err().is_inner(), "probe executed and failed");
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown restarted from the probe failure.
        clock.advance(Duration::from_millis(4_999));
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
        clock.advance(Duration::from_millis(1));
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn probe_slot_is_exclusive() {
        let clock = ManualClock::new();
        let breaker = breaker(&config(), clock.clone());

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(5_000));

        let invoked = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let breaker = breaker.clone();
            let invoked = invoked.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .execute(|| {
                        let invoked = invoked.clone();
                        async move {
                            invoked.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, TestError>(())
                        }
                    })
                    .await
            }));
        }

        let results: Vec<_> = join_all(handles).await;
        let successes =
            results.iter().filter(|r| r.as_ref().expect("join error").is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .expect("join error")
                    .as_ref()
                    .err()
                    .is_some_and(|e| e.is_circuit_open())
            })
            .count();

        assert_eq!(successes, 1, "exactly one probe runs");
        assert_eq!(rejections, 3);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_probe_releases_the_slot_without_a_sample() {
        let clock = ManualClock::new();
        let breaker = breaker(&config(), clock.clone());

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(5_000));

        // Probe future dropped at the deadline, before any outcome.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            breaker.execute(|| async {
                std::future::pending::<Result<(), TestError>>().await
            }),
        )
        .await;
        assert!(abandoned.is_err(), "probe was abandoned");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Slot is free again: the next call becomes the new probe.
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn non_transient_probe_outcome_leaves_the_circuit_half_open() {
        let clock = ManualClock::new();
        let breaker = breaker(&config(), clock.clone());

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(5_000));

        let result = breaker
            .execute(|| async { Err::<(), _>(TestError { class: FailureClass::NonTransient }) })
            .await;
        assert!(result.unwrap_err().is_inner());
        assert_eq!(breaker.state(), CircuitState::HalfOpen, "circuit undecided");

        // Slot was freed; a successful probe can still close it.
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn every_admitted_probe_emits_half_open() {
        let clock = ManualClock::new();
        let observer = MemoryObserver::new();
        let breaker = CircuitBreakerPolicy::new("svc".into(), &config(), Arc::new(observer.clone()))
            .with_clock(clock.clone());

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(5_000));

        // First probe returns a non-transient failure, freeing the slot
        // with the circuit still HalfOpen; the next call re-probes.
        let _ = breaker
            .execute(|| async { Err::<(), _>(TestError { class: FailureClass::NonTransient }) })
            .await;
        assert!(succeed(&breaker).await.is_ok());

        let half_open = observer
            .events_for("svc")
            .into_iter()
            .filter(|e| matches!(e, PolicyEvent::CircuitHalfOpen))
            .count();
        assert_eq!(half_open, 2, "the re-probe is visible to observers");
    }

    #[tokio::test]
    async fn concurrent_failures_trip_exactly_one_transition() {
        let observer = MemoryObserver::new();
        let breaker =
            CircuitBreakerPolicy::new("svc".into(), &config(), Arc::new(observer.clone()))
                .with_clock(ManualClock::new());

        let barrier = Arc::new(tokio::sync::Barrier::new(40));
        let mut handles = vec![];
        for _ in 0..40 {
            let breaker = breaker.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                breaker.execute(|| async { Err::<(), _>(transient()) }).await
            }));
        }
        let _ = join_all(handles).await;

        assert_eq!(breaker.state(), CircuitState::Open);
        let opened = observer
            .events_for("svc")
            .into_iter()
            .filter(|e| matches!(e, PolicyEvent::CircuitOpened { .. }))
            .count();
        assert_eq!(opened, 1, "exactly one closed-to-open transition");
    }
}
