//! Per-service policy configuration.
//!
//! Mirrors the external configuration surface: millisecond-valued fields
//! bound via serde (camelCase keys, the shape the config collaborator
//! emits), with `Duration` accessors for the policy constructors.
//!
//! Invariants enforced by [`ServicePolicyConfig::validate`]:
//! - `timeoutMs` > 0
//! - `circuitBreakerFailureThreshold` in (0, 1]
//! - `circuitBreakerSamplingDurationMs` and `circuitBreakerDurationMs` > 0
//! - `minimumThroughput` >= 1
//!
//! `retryIntervalMs` may be empty (no retries).

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Default minimum sample count before the failure-ratio check applies.
pub const DEFAULT_MINIMUM_THROUGHPUT: usize = 10;

fn default_minimum_throughput() -> usize {
    DEFAULT_MINIMUM_THROUGHPUT
}

fn default_fallback_enabled() -> bool {
    true
}

/// Immutable resilience settings for one named service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServicePolicyConfig {
    /// Target endpoint identifier. Opaque to the policies; consumed by the
    /// transport layer that issues the actual calls.
    pub base_address: String,
    /// Single-attempt ceiling in milliseconds.
    pub timeout_ms: u64,
    /// Wait before each retry, in order; the length is the retry budget.
    #[serde(default)]
    pub retry_interval_ms: Vec<u64>,
    /// Fraction in (0, 1]; the circuit opens at this rolling failure ratio.
    pub circuit_breaker_failure_threshold: f64,
    /// Width of the rolling statistics window, in milliseconds.
    pub circuit_breaker_sampling_duration_ms: u64,
    /// How long the circuit stays open before probing, in milliseconds.
    pub circuit_breaker_duration_ms: u64,
    /// Minimum samples in the window before the threshold check applies.
    #[serde(default = "default_minimum_throughput")]
    pub minimum_throughput: usize,
    /// Whether failures are absorbed into the fallback sentinel.
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
}

/// Validation failures for a single service entry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("timeoutMs must be > 0")]
    ZeroTimeout,
    #[error("circuitBreakerFailureThreshold must be in (0, 1] (got {0})")]
    InvalidFailureThreshold(f64),
    #[error("circuitBreakerSamplingDurationMs must be > 0")]
    ZeroSamplingDuration,
    #[error("circuitBreakerDurationMs must be > 0")]
    ZeroBreakDuration,
    #[error("minimumThroughput must be >= 1")]
    ZeroMinimumThroughput,
}

impl ServicePolicyConfig {
    /// Check the invariants listed in the module docs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let threshold = self.circuit_breaker_failure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::InvalidFailureThreshold(threshold));
        }
        if self.circuit_breaker_sampling_duration_ms == 0 {
            return Err(ConfigError::ZeroSamplingDuration);
        }
        if self.circuit_breaker_duration_ms == 0 {
            return Err(ConfigError::ZeroBreakDuration);
        }
        if self.minimum_throughput == 0 {
            return Err(ConfigError::ZeroMinimumThroughput);
        }
        Ok(())
    }

    /// Per-attempt deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay schedule; `retry_delays()[i]` is the wait before attempt `i + 2`.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_interval_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    /// Total attempts the pipeline will make (initial call plus retries).
    pub fn max_attempts(&self) -> usize {
        1 + self.retry_interval_ms.len()
    }

    /// Width of the circuit breaker's rolling window.
    pub fn sampling_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_sampling_duration_ms)
    }

    /// Cooldown the circuit spends open before admitting a probe.
    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_duration_ms)
    }
}
