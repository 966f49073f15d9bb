use std::sync::Arc;

use anyhow::Context;
use dtsched::config::Config;
use dtsched::database::setup_database;
use dtsched::dispatch::AmqpDispatchQueue;
use dtsched::poller::Poller;
use dtsched::store::PgTaskStore;
use dtsched::telemetry::init_tracing;
use tracing::info;

const BEAT_PREFETCH: u16 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url, config.db_max_connections)
    .await
    .context("Failed to set up database")?;
  let queue = AmqpDispatchQueue::connect(config.broker_url()?, BEAT_PREFETCH)
    .await
    .context("Failed to connect to RabbitMQ")?;

  let poller = Poller::new(Arc::new(PgTaskStore::new(db_pool)), Arc::new(queue), config.poller_config());
  poller
    .run(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("Shutdown signal received");
    })
    .await?;
  Ok(())
}
