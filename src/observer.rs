//! Policy lifecycle events and the observer hook that consumes them.
//!
//! Events are pure notifications: they never influence control flow.
//! Policies emit them synchronously on the calling task, so observers must
//! be cheap; anything expensive belongs behind a channel in the observer
//! implementation.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lifecycle events emitted while a call runs through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// A retry is about to wait and re-execute. `attempt` is 1-indexed over
    /// retries, so the first retry reports `attempt = 1`.
    Retry { attempt: usize, delay: Duration },
    /// An attempt exceeded its deadline and was abandoned.
    Timeout { elapsed: Duration },
    /// The circuit opened; subsequent calls are rejected without dialing.
    CircuitOpened { failures: usize, calls: usize },
    /// The cooldown elapsed and a probe call is being admitted.
    CircuitHalfOpen,
    /// A probe succeeded and normal traffic resumed.
    CircuitClosed,
    /// A failure was absorbed into the fallback sentinel.
    Fallback,
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry { attempt, delay } => {
                write!(f, "Retry(#{}, delay={:?})", attempt, delay)
            }
            PolicyEvent::Timeout { elapsed } => write!(f, "Timeout(elapsed={:?})", elapsed),
            PolicyEvent::CircuitOpened { failures, calls } => {
                write!(f, "CircuitOpened({}/{})", failures, calls)
            }
            PolicyEvent::CircuitHalfOpen => write!(f, "CircuitHalfOpen"),
            PolicyEvent::CircuitClosed => write!(f, "CircuitClosed"),
            PolicyEvent::Fallback => write!(f, "Fallback"),
        }
    }
}

/// Consumer of policy events, shared by every pipeline in a registry.
pub trait Observer: Send + Sync + fmt::Debug {
    fn on_event(&self, service: &str, event: &PolicyEvent);
}

/// Default observer: structured `tracing` records, one per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, service: &str, event: &PolicyEvent) {
        match event {
            PolicyEvent::Retry { attempt, delay } => {
                tracing::warn!(service, attempt, ?delay, "retrying after transient failure");
            }
            PolicyEvent::Timeout { elapsed } => {
                tracing::warn!(service, ?elapsed, "attempt timed out");
            }
            PolicyEvent::CircuitOpened { failures, calls } => {
                tracing::error!(service, failures, calls, "circuit opened");
            }
            PolicyEvent::CircuitHalfOpen => {
                tracing::info!(service, "circuit half-open, admitting probe");
            }
            PolicyEvent::CircuitClosed => {
                tracing::info!(service, "circuit closed");
            }
            PolicyEvent::Fallback => {
                tracing::warn!(service, "returning fallback response");
            }
        }
    }
}

/// Observer that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _service: &str, _event: &PolicyEvent) {}
}

/// Observer that stores events in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryObserver {
    events: Arc<Mutex<Vec<(String, PolicyEvent)>>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded (service, event) pairs in emission order.
    pub fn events(&self) -> Vec<(String, PolicyEvent)> {
        self.events.lock().expect("memory observer poisoned").clone()
    }

    /// Events recorded for one service, in emission order.
    pub fn events_for(&self, service: &str) -> Vec<PolicyEvent> {
        self.events
            .lock()
            .expect("memory observer poisoned")
            .iter()
            .filter(|(s, _)| s == service)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("memory observer poisoned").clear();
    }
}

impl Observer for MemoryObserver {
    fn on_event(&self, service: &str, event: &PolicyEvent) {
        self.events
            .lock()
            .expect("memory observer poisoned")
            .push((service.to_string(), event.clone()));
    }
}
