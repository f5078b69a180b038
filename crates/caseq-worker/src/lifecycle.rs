//! Process lifecycle: ordered, run-once shutdown.
//!
//! Components register a cleanup callback and a [`CleanupPhase`] during
//! startup. On the first termination signal the coordinator moves to
//! draining and runs every callback, phase by phase and in registration
//! order within a phase. A failing callback is logged and the drain goes on.
//! Later signals are ignored.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use crate::error::WorkerResult;

type CleanupFuture = Pin<Box<dyn Future<Output = WorkerResult<()>> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// When a cleanup runs relative to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CleanupPhase {
    /// Stop accepting work from outside (HTTP server, producers)
    Intake,
    /// Stop pulling jobs and drain in-flight handlers
    Workers,
    /// Close broker and other connections
    Connections,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Terminated,
}

struct Cleanup {
    name: String,
    phase: CleanupPhase,
    run: CleanupFn,
}

/// Outcome of a drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Cleanups that ran, in order
    pub completed: Vec<String>,
    /// Cleanups that failed, with their error
    pub failed: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the cleanup registry and the running -> draining -> terminated state.
pub struct LifecycleCoordinator {
    state: Mutex<LifecycleState>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LifecycleCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Running),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Register a cleanup callback. Ignored once shutdown has begun.
    pub fn register<F, Fut>(&self, name: impl Into<String>, phase: CleanupPhase, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = WorkerResult<()>> + Send + 'static,
    {
        let name = name.into();
        if self.state() != LifecycleState::Running {
            warn!(cleanup = %name, "Shutdown in progress, cleanup not registered");
            return;
        }

        lock(&self.cleanups).push(Cleanup {
            name,
            phase,
            run: Box::new(move || -> CleanupFuture { Box::pin(cleanup()) }),
        });
    }

    /// Drain every registered cleanup. Only the first call does anything;
    /// later calls return `None`.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        {
            let mut state = lock(&self.state);
            if *state != LifecycleState::Running {
                info!("Shutdown already in progress, ignoring");
                return None;
            }
            *state = LifecycleState::Draining;
        }

        let mut cleanups = std::mem::take(&mut *lock(&self.cleanups));
        // Stable sort keeps registration order within a phase.
        cleanups.sort_by_key(|cleanup| cleanup.phase);

        info!(count = cleanups.len(), "Draining");
        let mut report = ShutdownReport::default();

        for cleanup in cleanups {
            info!(cleanup = %cleanup.name, phase = ?cleanup.phase, "Running cleanup");
            match (cleanup.run)().await {
                Ok(()) => report.completed.push(cleanup.name),
                Err(e) => {
                    error!(cleanup = %cleanup.name, "Cleanup failed: {}", e);
                    report.failed.push((cleanup.name, e.to_string()));
                }
            }
        }

        *lock(&self.state) = LifecycleState::Terminated;
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Shutdown complete"
        );
        Some(report)
    }

    /// Wait for Ctrl-C or SIGTERM, then drain. Signals received while
    /// draining are logged and ignored.
    pub async fn run_until_signal(self: &Arc<Self>) -> Option<ShutdownReport> {
        wait_for_signal().await;
        info!("Received shutdown signal");

        let repeats = {
            let lifecycle = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    wait_for_signal().await;
                    lifecycle.shutdown().await;
                }
            })
        };

        let report = self.shutdown().await;
        repeats.abort();
        report
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::WorkerError;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<WorkerResult<()>> + Send + 'static {
        let log = Arc::clone(log);
        move || {
            log.lock().unwrap().push(name);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_phases_run_in_order_regardless_of_registration() {
        let log = recorder();
        let lifecycle = LifecycleCoordinator::new();

        lifecycle.register("redis", CleanupPhase::Connections, record(&log, "redis"));
        lifecycle.register("email worker", CleanupPhase::Workers, record(&log, "email"));
        lifecycle.register("http", CleanupPhase::Intake, record(&log, "http"));
        lifecycle.register("ai worker", CleanupPhase::Workers, record(&log, "ai"));

        let report = lifecycle.shutdown().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["http", "email", "ai", "redis"]);
        assert!(report.is_clean());
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_failing_cleanup_does_not_abort_drain() {
        let log = recorder();
        let lifecycle = LifecycleCoordinator::new();

        lifecycle.register("worker", CleanupPhase::Workers, || async {
            Err::<(), _>(WorkerError::job_failed("drain failed"))
        });
        lifecycle.register("redis", CleanupPhase::Connections, record(&log, "redis"));

        let report = lifecycle.shutdown().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["redis"]);
        assert_eq!(report.completed, vec!["redis".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "worker");
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let log = recorder();
        let lifecycle = LifecycleCoordinator::new();
        lifecycle.register("redis", CleanupPhase::Connections, record(&log, "redis"));

        assert!(lifecycle.shutdown().await.is_some());
        assert!(lifecycle.shutdown().await.is_none());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_signal_while_draining_is_ignored() {
        let lifecycle = Arc::new(LifecycleCoordinator::new());
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        lifecycle.register("slow worker", CleanupPhase::Workers, move || async move {
            let _ = wait.await;
            Ok::<(), WorkerError>(())
        });

        let first = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.shutdown().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(lifecycle.state(), LifecycleState::Draining);

        assert!(lifecycle.shutdown().await.is_none());

        release.send(()).unwrap();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.completed, vec!["slow worker".to_string()]);
    }

    #[tokio::test]
    async fn test_register_after_shutdown_is_ignored() {
        let log = recorder();
        let lifecycle = LifecycleCoordinator::new();
        lifecycle.shutdown().await;

        lifecycle.register("late", CleanupPhase::Workers, record(&log, "late"));
        assert!(lifecycle.shutdown().await.is_none());
        assert!(log.lock().unwrap().is_empty());
    }
}
