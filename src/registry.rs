//! Service-name → pipeline registry.
//!
//! Built once at startup from the full set of per-service configs, then
//! shared read-only across every inbound request. Looking up a name that
//! was never configured is a configuration error, not a runtime condition:
//! the registry is expected to be populated from the same document that
//! declares the caller's dependencies.

use crate::circuit_breaker::CircuitState;
use crate::config::{ConfigError, ServicePolicyConfig};
use crate::error::{Classify, PipelineError};
use crate::fallback::CallOutcome;
use crate::observer::{Observer, TracingObserver};
use crate::pipeline::PolicyPipeline;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised while building or consulting the registry.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The requested service has no configured pipeline.
    #[error("service '{service}' is not configured")]
    UnknownService { service: String },
    /// A service entry failed validation at build time.
    #[error("invalid policy configuration for service '{service}'")]
    InvalidConfig {
        service: String,
        #[source]
        source: ConfigError,
    },
}

/// Failure of a registry-level execute: either the lookup or the call.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError<E>),
}

impl<E> ExecuteError<E> {
    /// The pipeline failure, if the lookup succeeded.
    pub fn into_pipeline(self) -> Option<PipelineError<E>> {
        match self {
            Self::Pipeline(e) => Some(e),
            Self::Registry(_) => None,
        }
    }
}

/// Immutable mapping from service name to compiled pipeline.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    pipelines: HashMap<String, PolicyPipeline>,
}

impl PolicyRegistry {
    /// Compile one pipeline per config entry, reporting events to `tracing`.
    pub fn build<I>(configs: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (String, ServicePolicyConfig)>,
    {
        Self::build_with_observer(configs, Arc::new(TracingObserver))
    }

    /// Compile one pipeline per config entry with an explicit observer.
    ///
    /// Each build produces fresh circuit state: two registries built from
    /// the same configs share nothing.
    pub fn build_with_observer<I>(
        configs: I,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (String, ServicePolicyConfig)>,
    {
        let mut pipelines = HashMap::new();
        for (service, config) in configs {
            let pipeline =
                PolicyPipeline::new(&service, &config, observer.clone()).map_err(|source| {
                    RegistryError::InvalidConfig { service: service.clone(), source }
                })?;
            tracing::debug!(
                service = %service,
                base_address = %pipeline.base_address(),
                max_attempts = pipeline.max_attempts(),
                "compiled policy pipeline"
            );
            pipelines.insert(service, pipeline);
        }
        Ok(Self { pipelines })
    }

    /// Look up the pipeline for a service.
    pub fn get(&self, service: &str) -> Result<&PolicyPipeline, RegistryError> {
        self.pipelines
            .get(service)
            .ok_or_else(|| RegistryError::UnknownService { service: service.to_string() })
    }

    /// Whether a pipeline exists for this service name.
    pub fn contains(&self, service: &str) -> bool {
        self.pipelines.contains_key(service)
    }

    /// Configured service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Current circuit phase for a service.
    pub fn circuit_state(&self, service: &str) -> Result<CircuitState, RegistryError> {
        Ok(self.get(service)?.circuit_state())
    }

    /// Circuit phases for every service, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut entries: Vec<(String, CircuitState)> = self
            .pipelines
            .iter()
            .map(|(name, pipeline)| (name.clone(), pipeline.circuit_state()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Run a remote call through the named service's pipeline.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        service: &str,
        operation: Op,
    ) -> Result<CallOutcome<T>, ExecuteError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let pipeline = self.get(service)?;
        Ok(pipeline.execute(operation).await?)
    }

    /// Like [`execute`](Self::execute), honoring a cancellation token.
    pub async fn execute_cancellable<T, E, Fut, Op>(
        &self,
        service: &str,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<CallOutcome<T>, ExecuteError<E>>
    where
        T: Send,
        E: Classify + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let pipeline = self.get(service)?;
        Ok(pipeline.execute_cancellable(cancel, operation).await?)
    }
}
