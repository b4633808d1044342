#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Palisade
//!
//! A resilience layer for named outbound service calls. Each service gets a
//! compiled pipeline of four policies (fallback, retry, timeout, circuit
//! breaker) wrapped around whatever "invoke the remote operation" closure
//! the transport layer supplies. Every call resolves to a real response,
//! the degraded fallback sentinel, or a typed failure; never an unbounded
//! hang.
//!
//! ## Policy order
//!
//! Outermost to innermost: **Fallback → Retry → Timeout → CircuitBreaker →
//! remote call**. Fallback catches everything bubbling up from the inner
//! layers (including retry exhaustion, timeouts, and circuit-open
//! rejections); retry wraps timeout and the breaker so each attempt gets
//! its own fresh deadline and circuit evaluation.
//!
//! ## Quick start
//!
//! ```rust
//! use palisade::{CallOutcome, Classify, FailureClass, PolicyRegistry, ServicePolicyConfig};
//!
//! #[derive(Debug)]
//! struct CallError;
//!
//! impl std::fmt::Display for CallError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "upstream unavailable")
//!     }
//! }
//!
//! impl std::error::Error for CallError {}
//!
//! impl Classify for CallError {
//!     fn class(&self) -> FailureClass {
//!         FailureClass::Transient
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServicePolicyConfig {
//!         base_address: "https://orders.internal".into(),
//!         timeout_ms: 2000,
//!         retry_interval_ms: vec![1000, 2000],
//!         circuit_breaker_failure_threshold: 0.5,
//!         circuit_breaker_sampling_duration_ms: 10_000,
//!         circuit_breaker_duration_ms: 30_000,
//!         minimum_throughput: 10,
//!         fallback_enabled: true,
//!     };
//!     let registry = PolicyRegistry::build(vec![("orders".to_string(), config)]).unwrap();
//!
//!     let outcome = registry
//!         .execute("orders", || async { Ok::<_, CallError>("order #42") })
//!         .await
//!         .unwrap();
//!
//!     match outcome {
//!         CallOutcome::Ok(body) => println!("{body}"),
//!         CallOutcome::Fallback => println!("dependency unavailable"),
//!     }
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod observer;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod time;
pub mod timeout;

// Re-exports
pub use circuit_breaker::{CircuitBreakerPolicy, CircuitState};
pub use config::{ConfigError, ServicePolicyConfig, DEFAULT_MINIMUM_THROUGHPUT};
pub use error::{Classify, FailureClass, PipelineError};
pub use fallback::{CallOutcome, FallbackPolicy};
pub use observer::{MemoryObserver, NullObserver, Observer, PolicyEvent, TracingObserver};
pub use pipeline::PolicyPipeline;
pub use registry::{ExecuteError, PolicyRegistry, RegistryError};
pub use retry::RetryPolicy;
pub use time::{
    Clock, InstantSleeper, ManualClock, MonotonicClock, Sleeper, TokioSleeper, TrackingSleeper,
};
pub use timeout::TimeoutPolicy;
