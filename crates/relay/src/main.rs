use std::sync::Arc;

use anyhow::Context;

use outbox_infra::publisher::RedisPublisher;
use outbox_infra::store::PostgresOutboxStore;
use outbox_infra::{OutboxEngine, PostgresConfig, RedisConfig, RelayConfig, RelayScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outbox_observability::init();

    let relay_config = RelayConfig::from_env().context("invalid relay configuration")?;
    let postgres_config = PostgresConfig::from_env().context("invalid postgres configuration")?;
    let redis_config = RedisConfig::from_env().context("invalid redis configuration")?;

    let store = PostgresOutboxStore::connect(&postgres_config)
        .await
        .context("failed to connect to postgres")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare outbox schema")?;

    let publisher = RedisPublisher::new(&redis_config).context("failed to build redis publisher")?;

    let engine = Arc::new(OutboxEngine::new(store.clone(), publisher, relay_config)?);

    tracing::info!(
        batch_size = engine.config().batch_size,
        channel = %engine.config().channel,
        "outbox relay starting"
    );
    let scheduler = RelayScheduler::spawn(engine.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = scheduler.shutdown().await;
    engine.close().await;
    store.close().await;

    tracing::info!(stats = %serde_json::to_string(&stats)?, "outbox relay stopped");
    Ok(())
}
