//! Per-provider circuit breaker.
//!
//! One breaker exists per external dependency and is shared by every worker
//! that calls it. State lives behind a mutex that is never held across an
//! await, so each transition is a single atomic read-modify-write.
//!
//! ```text
//! Closed --(threshold failures in window)--> Open
//! Open --(cooldown elapsed)--> HalfOpen (one trial call)
//! HalfOpen --(trial ok)--> Closed
//! HalfOpen --(trial failed)--> Open
//! ```

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use caseq_models::Provider;

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    #[default]
    Closed,
    /// Tripped - calls fail immediately.
    Open,
    /// Testing recovery - one trial call is allowed.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    pub(crate) fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Window in which failures are counted. The window is fixed, not
    /// sliding: it starts at the first failure after a reset, and the first
    /// failure past its end starts a new window with a count of one.
    pub failure_window: Duration,
    /// Time spent open before a trial call is allowed.
    pub cooldown: Duration,
    /// Timeout applied to every wrapped call.
    pub call_timeout: Duration,
}

impl BreakerConfig {
    /// Defaults for a provider: AI calls may take two minutes, email should not.
    pub fn for_provider(provider: Provider) -> Self {
        let call_timeout = if provider.is_ai() {
            Duration::from_secs(120)
        } else {
            Duration::from_secs(15)
        };

        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            call_timeout,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker, for health output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub provider: Provider,
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_successes: u32,
    /// Milliseconds since the breaker last opened, if it is not closed.
    pub open_for_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    window_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker for a single external provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: Provider,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    pub fn new(provider: Provider, config: BreakerConfig) -> Self {
        metrics::set_breaker_state(provider, CircuitState::Closed);
        Self {
            provider,
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying the open -> half-open cool-down if it elapsed.
    pub fn state(&self) -> CircuitState {
        let guard = self.lock();
        match guard.state {
            CircuitState::Open if self.cooldown_elapsed(&guard) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let guard = self.lock();
        let state = match guard.state {
            CircuitState::Open if self.cooldown_elapsed(&guard) => CircuitState::HalfOpen,
            state => state,
        };

        BreakerSnapshot {
            provider: self.provider,
            state,
            failure_count: guard.failure_count,
            consecutive_successes: guard.consecutive_successes,
            open_for_ms: guard
                .opened_at
                .filter(|_| state != CircuitState::Closed)
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Returns [`WorkerError::BreakerOpen`] without polling `call` while the
    /// circuit is open, or while another caller holds the half-open trial.
    /// The call is bounded by `call_timeout`; a timeout counts as a failure.
    pub async fn call<T, F>(&self, call: F) -> WorkerResult<T>
    where
        F: Future<Output = WorkerResult<T>>,
    {
        let mut permit = self.admit()?;

        let outcome = match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(self.config.call_timeout)),
        };

        match &outcome {
            Ok(_) => self.on_success(permit.settle()),
            Err(e) if e.counts_against_provider() => self.on_failure(permit.settle(), e),
            // Payload or config errors say nothing about the provider; a trial
            // that hits one is released without a verdict.
            Err(_) => {}
        }

        outcome
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooldown_elapsed(&self, state: &BreakerState) -> bool {
        state
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.config.cooldown)
    }

    fn admit(&self) -> WorkerResult<Permit<'_>> {
        let mut guard = self.lock();

        let admission = match guard.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open if self.cooldown_elapsed(&guard) => {
                guard.state = CircuitState::HalfOpen;
                guard.trial_in_flight = true;
                info!(provider = %self.provider, "Circuit breaker half-open, allowing trial call");
                metrics::set_breaker_state(self.provider, CircuitState::HalfOpen);
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen if !guard.trial_in_flight => {
                guard.trial_in_flight = true;
                Some(Admission::Trial)
            }
            CircuitState::Open | CircuitState::HalfOpen => None,
        };

        match admission {
            Some(admission) => Ok(Permit {
                breaker: self,
                admission,
                settled: false,
            }),
            None => {
                debug!(provider = %self.provider, state = guard.state.as_str(), "Call rejected by circuit breaker");
                metrics::record_breaker_rejection(self.provider);
                Err(WorkerError::BreakerOpen(self.provider))
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut guard = self.lock();

        match (admission, guard.state) {
            (Admission::Trial, _) => {
                guard.state = CircuitState::Closed;
                guard.failure_count = 0;
                guard.consecutive_successes = 1;
                guard.window_started_at = None;
                guard.opened_at = None;
                guard.trial_in_flight = false;
                info!(provider = %self.provider, "Circuit breaker closed after successful trial");
                metrics::set_breaker_state(self.provider, CircuitState::Closed);
            }
            (Admission::Normal, CircuitState::Closed) => {
                guard.failure_count = 0;
                guard.window_started_at = None;
                guard.consecutive_successes = guard.consecutive_successes.saturating_add(1);
            }
            // Admitted while closed but another caller opened the circuit since.
            (Admission::Normal, _) => {}
        }
    }

    fn on_failure(&self, admission: Admission, error: &WorkerError) {
        let mut guard = self.lock();
        let now = Instant::now();
        guard.consecutive_successes = 0;

        match (admission, guard.state) {
            (Admission::Trial, _) => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(now);
                guard.trial_in_flight = false;
                warn!(provider = %self.provider, error = %error, "Trial call failed, circuit breaker re-opened");
                metrics::set_breaker_state(self.provider, CircuitState::Open);
            }
            (Admission::Normal, CircuitState::Closed) => {
                let window_expired = guard
                    .window_started_at
                    .map_or(true, |started| now.duration_since(started) > self.config.failure_window);
                if window_expired {
                    guard.failure_count = 0;
                    guard.window_started_at = Some(now);
                }
                guard.failure_count += 1;

                if guard.failure_count >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(now);
                    warn!(
                        provider = %self.provider,
                        failures = guard.failure_count,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit breaker opened"
                    );
                    metrics::set_breaker_state(self.provider, CircuitState::Open);
                } else {
                    debug!(
                        provider = %self.provider,
                        failures = guard.failure_count,
                        threshold = self.config.failure_threshold,
                        "Provider failure recorded"
                    );
                }
            }
            (Admission::Normal, _) => {}
        }
    }

    fn release_trial(&self) {
        let mut guard = self.lock();
        if guard.state == CircuitState::HalfOpen {
            guard.trial_in_flight = false;
        }
    }
}

/// Admission ticket for one call. Releases the half-open trial slot if the
/// call is dropped or ends without a verdict.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self) -> Admission {
        self.settled = true;
        self.admission
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.release_trial();
        }
    }
}
