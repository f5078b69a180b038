//! Per-job provider routing.
//!
//! Each job is routed once, before its handler runs, to a [`CallPolicy`]:
//! wrap the handler with one provider's breaker, or leave resilience to a
//! handler that picks its provider at call time.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use caseq_api::HealthProbe;
use caseq_models::{Job, Provider, ProviderPreference, QueueName};

use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

/// One breaker per external provider, shared by every worker in the process.
#[derive(Debug, Clone)]
pub struct Breakers {
    by_provider: BTreeMap<Provider, Arc<CircuitBreaker>>,
}

impl Breakers {
    pub fn new(configure: impl Fn(Provider) -> BreakerConfig) -> Self {
        let by_provider = Provider::ALL
            .into_iter()
            .map(|provider| (provider, Arc::new(CircuitBreaker::new(provider, configure(provider)))))
            .collect();
        Self { by_provider }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(|provider| config.breaker_config(provider))
    }

    pub fn get(&self, provider: Provider) -> WorkerResult<Arc<CircuitBreaker>> {
        self.by_provider
            .get(&provider)
            .cloned()
            .ok_or_else(|| WorkerError::config_error(format!("no breaker for {provider}")))
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.by_provider.values().map(|b| b.snapshot()).collect()
    }
}

impl HealthProbe for Breakers {
    fn name(&self) -> &'static str {
        "breakers"
    }

    fn status(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshots()).unwrap_or_default()
    }
}

/// How a job's handler invocation is protected.
#[derive(Debug, Clone)]
pub enum CallPolicy {
    /// Wrap the call with this provider's breaker.
    Guarded {
        provider: Provider,
        breaker: Arc<CircuitBreaker>,
    },
    /// The handler selects a provider itself and owns its fallback; only the
    /// queue's handler timeout applies.
    SelfManaged,
}

impl CallPolicy {
    /// The provider the call is attributed to, if it is known up front.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            CallPolicy::Guarded { provider, .. } => Some(*provider),
            CallPolicy::SelfManaged => None,
        }
    }

    /// Run a handler invocation under this policy.
    pub async fn run<T, F>(&self, handler_timeout: Duration, call: F) -> WorkerResult<T>
    where
        F: Future<Output = WorkerResult<T>>,
    {
        match self {
            CallPolicy::Guarded { breaker, .. } => breaker.call(call).await,
            CallPolicy::SelfManaged => tokio::time::timeout(handler_timeout, call)
                .await
                .unwrap_or(Err(WorkerError::Timeout(handler_timeout))),
        }
    }
}

/// Chooses the [`CallPolicy`] for each job.
#[derive(Debug, Clone)]
pub struct ProviderRouter {
    breakers: Arc<Breakers>,
    default_ai_provider: Provider,
}

impl ProviderRouter {
    pub fn new(breakers: Arc<Breakers>, default_ai_provider: Provider) -> Self {
        Self {
            breakers,
            default_ai_provider,
        }
    }

    pub fn breakers(&self) -> &Arc<Breakers> {
        &self.breakers
    }

    /// Route a job by its payload's `provider` field, falling back to the
    /// queue default when the field is absent or unrecognised.
    pub fn select(&self, job: &Job) -> WorkerResult<CallPolicy> {
        let provider = if job.queue == QueueName::Email {
            Provider::Email
        } else {
            match job.payload_str("provider") {
                None => self.default_ai_provider,
                Some(raw) => match ProviderPreference::parse(raw) {
                    Some(preference) => match preference.fixed() {
                        Some(provider) => provider,
                        None => return Ok(CallPolicy::SelfManaged),
                    },
                    None => {
                        warn!(
                            queue = %job.queue,
                            job_id = %job.id,
                            provider = raw,
                            "Unknown provider on job, using default"
                        );
                        self.default_ai_provider
                    }
                },
            }
        };

        Ok(CallPolicy::Guarded {
            provider,
            breaker: self.breakers.get(provider)?,
        })
    }
}
