use jobline_queue::{Broker, RedisBroker};
use jobline_worker::retry::{retry_async, RetryConfig};
use jobline_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;
    dotenvy::dotenv().ok();

    ensure_env_present(&["REDIS_URL"])?;
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with lock_duration={:?} queue overrides={:?}",
        config.lock_duration, config.queue_concurrency
    );
    ensure_broker(&config).await?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_broker(config: &WorkerConfig) -> anyhow::Result<()> {
    let broker = RedisBroker::from_env()?;
    let retry = RetryConfig::new("redis ping").with_max_retries(config.startup_retries);
    retry_async(&retry, || broker.ping())
        .await
        .map_err(|e| anyhow::anyhow!("redis not reachable: {}", e))?;
    broker.close().await?;
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
