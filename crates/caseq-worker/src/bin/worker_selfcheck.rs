use caseq_queue::{JobBroker, RedisBroker};
use caseq_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    ensure_env_present(&["REDIS_URL", "HANDLER_BASE_URL"])?;

    let config = WorkerConfig::from_env()?;
    println!(
        "worker-selfcheck: starting with queues={:?} handler_base_url={}",
        config.queues, config.handler_base_url
    );

    ensure_broker_reachable(&config).await?;

    println!("worker-selfcheck: ok");
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}

async fn ensure_broker_reachable(config: &WorkerConfig) -> anyhow::Result<()> {
    let broker = RedisBroker::from_env()?;
    for &queue in &config.queues {
        let counts = broker
            .counts(queue)
            .await
            .map_err(|e| anyhow::anyhow!("broker not reachable for {}: {}", queue, e))?;
        println!(
            "worker-selfcheck: {} waiting={} active={} failed={}",
            queue, counts.waiting, counts.active, counts.failed
        );
    }
    broker.close().await?;
    Ok(())
}
