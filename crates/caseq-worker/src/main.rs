//! Background job worker binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caseq_api::{create_router, metrics as api_metrics, ApiConfig, AppState};
use caseq_queue::{JobBroker, RedisBroker};
use caseq_worker::retry::{retry_async, RetryConfig};
use caseq_worker::{
    Breakers, CleanupPhase, HttpDispatchHandler, LifecycleCoordinator, ProviderRouter, QueueWorker,
    TracingDiagnostics, WorkerConfig, WorkerContext, WorkerError, WorkerHandle, WorkerResult,
};

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("caseq=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    // Required for rustls 0.23+ (Redis TLS and the dispatch client)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting caseq-worker");

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    info!(
        queues = ?config.queues,
        default_ai_provider = %config.default_ai_provider,
        handler_base_url = %config.handler_base_url,
        "Worker config loaded"
    );
    if config.handler_secret.is_none() {
        warn!("HANDLER_SECRET not set, jobs are dispatched without a shared secret");
    }

    let redis = Arc::new(RedisBroker::from_env().context("invalid Redis configuration")?);
    let init_retry = RetryConfig::new("broker init")
        .with_max_retries(5)
        .with_base_delay(Duration::from_secs(1));
    retry_async(&init_retry, || redis.init())
        .await
        .into_result()
        .context("failed to initialize Redis consumer groups")?;
    let broker: Arc<dyn JobBroker> = redis;

    let breakers = Arc::new(Breakers::from_config(&config));
    let router = Arc::new(ProviderRouter::new(
        Arc::clone(&breakers),
        config.default_ai_provider,
    ));
    let ctx = WorkerContext::new(Arc::clone(&broker), router, Arc::new(TracingDiagnostics));
    let lifecycle = Arc::new(LifecycleCoordinator::new());

    // Health, admin and metrics endpoints
    let api_config = ApiConfig::from_env();
    let metrics_handle = if api_config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(api_metrics::init_metrics().context("failed to install metrics recorder")?)
    } else {
        None
    };
    let addr = format!("{}:{}", api_config.host, api_config.port);
    let state = AppState::new(api_config, Arc::clone(&broker)).with_probe(breakers);
    let app = create_router(state, metrics_handle);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    let (stop_http, http_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = http_stopped.await;
            })
            .await
    });
    lifecycle.register("http server", CleanupPhase::Intake, move || async move {
        let _ = stop_http.send(());
        server.await.map_err(std::io::Error::from)??;
        Ok::<(), WorkerError>(())
    });

    // One worker per queue
    let mut handles: Vec<WorkerHandle> = Vec::with_capacity(config.queues.len());
    for &queue in &config.queues {
        let options = config.queue_options(queue);
        let handler = HttpDispatchHandler::new(
            &config.handler_base_url,
            queue,
            config.handler_secret.clone(),
            options.handler_timeout,
        )?;
        let worker = QueueWorker::new(queue, options, ctx.clone(), Arc::new(handler))
            .with_context(|| format!("failed to start {queue} worker"))?
            .with_config(&config);
        handles.push(worker.spawn());
    }

    lifecycle.register("queue workers", CleanupPhase::Workers, move || async move {
        // Drain every queue at once so each gets the full shutdown timeout.
        futures::future::join_all(handles.into_iter().map(WorkerHandle::shutdown))
            .await
            .into_iter()
            .collect::<WorkerResult<Vec<()>>>()
            .map(|_| ())
    });

    let closing = Arc::clone(&broker);
    lifecycle.register("redis broker", CleanupPhase::Connections, move || async move {
        closing.close().await.map_err(WorkerError::from)
    });

    match lifecycle.run_until_signal().await {
        Some(report) if !report.is_clean() => {
            for (name, err) in &report.failed {
                error!(cleanup = %name, "Cleanup failed: {}", err);
            }
            anyhow::bail!("{} cleanup step(s) failed during shutdown", report.failed.len());
        }
        _ => {
            info!("Worker shutdown complete");
            Ok(())
        }
    }
}
