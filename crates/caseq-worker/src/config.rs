//! Worker configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use caseq_models::{Provider, ProviderPreference, QueueName};
use caseq_queue::QueueOptions;

use crate::circuit_breaker::BreakerConfig;
use crate::error::{WorkerError, WorkerResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues this process consumes
    pub queues: Vec<QueueName>,
    /// Per-queue concurrency overrides
    pub concurrency: HashMap<QueueName, usize>,
    /// AI provider used when a job does not name one
    pub default_ai_provider: Provider,
    /// Failures within the window that open a breaker
    pub breaker_failure_threshold: u32,
    pub breaker_failure_window: Duration,
    pub breaker_cooldown: Duration,
    /// Timeout for calls through an AI provider breaker
    pub ai_call_timeout: Duration,
    /// Timeout for calls through the email breaker
    pub email_call_timeout: Duration,
    /// How long each worker may take to drain on shutdown
    pub shutdown_timeout: Duration,
    /// How long a fetch blocks waiting for new jobs
    pub fetch_block: Duration,
    /// Back-off after a broker error in the consume loop
    pub error_backoff: Duration,
    /// Base URL of the service that runs job handlers
    pub handler_base_url: String,
    /// Shared secret sent to the handler service
    pub handler_secret: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: QueueName::worker_queues().collect(),
            concurrency: HashMap::new(),
            default_ai_provider: Provider::Anthropic,
            breaker_failure_threshold: 5,
            breaker_failure_window: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(30),
            ai_call_timeout: Duration::from_secs(120),
            email_call_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            fetch_block: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            handler_base_url: "http://localhost:3000/internal/jobs".to_string(),
            handler_secret: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let queues = match std::env::var("WORKER_QUEUES") {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(|name| {
                    name.trim()
                        .parse::<QueueName>()
                        .map_err(|e| WorkerError::config_error(e.to_string()))
                })
                .collect::<WorkerResult<Vec<_>>>()?,
            _ => defaults.queues.clone(),
        };

        let concurrency = QueueName::worker_queues()
            .filter_map(|queue| {
                let key = format!("WORKER_CONCURRENCY_{}", queue.env_key());
                std::env::var(&key)
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .map(|n| (queue, n))
            })
            .collect();

        let default_ai_provider = match std::env::var("DEFAULT_AI_PROVIDER") {
            Ok(value) => ProviderPreference::parse(&value)
                .and_then(|p| p.fixed())
                .ok_or_else(|| {
                    WorkerError::config_error(format!(
                        "DEFAULT_AI_PROVIDER must be anthropic or openai, got {value:?}"
                    ))
                })?,
            Err(_) => defaults.default_ai_provider,
        };

        let config = Self {
            queues,
            concurrency,
            default_ai_provider,
            breaker_failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_failure_window: Duration::from_secs(env_or("BREAKER_FAILURE_WINDOW_SECS", 60)),
            breaker_cooldown: Duration::from_secs(env_or("BREAKER_COOLDOWN_SECS", 30)),
            ai_call_timeout: Duration::from_secs(env_or("BREAKER_AI_TIMEOUT_SECS", 120)),
            email_call_timeout: Duration::from_secs(env_or("BREAKER_EMAIL_TIMEOUT_SECS", 15)),
            shutdown_timeout: Duration::from_secs(env_or("WORKER_SHUTDOWN_TIMEOUT", 30)),
            fetch_block: Duration::from_millis(env_or("WORKER_FETCH_BLOCK_MS", 1000)),
            error_backoff: Duration::from_millis(env_or("WORKER_ERROR_BACKOFF_MS", 5000)),
            handler_base_url: std::env::var("HANDLER_BASE_URL")
                .unwrap_or(defaults.handler_base_url),
            handler_secret: std::env::var("HANDLER_SECRET").ok().filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Consumer options for a queue, with any concurrency override applied.
    pub fn queue_options(&self, queue: QueueName) -> QueueOptions {
        let options = QueueOptions::for_queue(queue);
        match self.concurrency.get(&queue) {
            Some(&n) => options.with_concurrency(n),
            None => options,
        }
    }

    /// Breaker settings for a provider.
    pub fn breaker_config(&self, provider: Provider) -> BreakerConfig {
        let call_timeout = if provider.is_ai() {
            self.ai_call_timeout
        } else {
            self.email_call_timeout
        };

        BreakerConfig::for_provider(provider)
            .with_failure_threshold(self.breaker_failure_threshold)
            .with_failure_window(self.breaker_failure_window)
            .with_cooldown(self.breaker_cooldown)
            .with_call_timeout(call_timeout)
    }

    /// Providers whose breaker may wrap a job on this queue.
    pub fn providers_for(queue: QueueName) -> &'static [Provider] {
        if queue == QueueName::Email {
            &[Provider::Email]
        } else {
            &[Provider::Anthropic, Provider::OpenAi]
        }
    }

    /// Check the lock/timeout invariant for every consumed queue.
    ///
    /// A lock that can expire while a handler or breaker call is still inside
    /// its own timeout would hand the job to a second worker.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.queues.contains(&QueueName::DeadLetter) {
            return Err(WorkerError::config_error(
                "the dead-letter queue is for operators and has no worker",
            ));
        }

        for &queue in &self.queues {
            let options = self.queue_options(queue);
            options
                .validate()
                .map_err(|e| WorkerError::config_error(format!("{queue}: {e}")))?;

            for &provider in Self::providers_for(queue) {
                let timeout = self.breaker_config(provider).call_timeout;
                if timeout >= options.timing.lock_duration {
                    return Err(WorkerError::config_error(format!(
                        "{queue}: {provider} call timeout {timeout:?} must be below lock duration {:?}",
                        options.timing.lock_duration
                    )));
                }
            }
        }
        Ok(())
    }
}
