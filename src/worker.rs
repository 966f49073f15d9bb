use std::sync::Arc;

use anyhow::Context;
use dtsched::config::Config;
use dtsched::database::setup_database;
use dtsched::dispatch::AmqpDispatchQueue;
use dtsched::executor::Executor;
use dtsched::mail::SmtpMailTransport;
use dtsched::report::PdfReportRenderer;
use dtsched::store::PgTaskStore;
use dtsched::telemetry::init_tracing;
use dtsched::worker_processing::Collaborators;
use dtsched::worker_scheduler::WorkerPool;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url, config.db_max_connections)
    .await
    .context("Failed to set up database")?;
  let prefetch = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
  let queue = Arc::new(
    AmqpDispatchQueue::connect(config.broker_url()?, prefetch)
      .await
      .context("Failed to connect to RabbitMQ")?,
  );

  let collaborators = Collaborators {
    mail: Arc::new(SmtpMailTransport::new(config.smtp.clone())),
    reports: Arc::new(PdfReportRenderer::new(config.report_dir.clone())),
  };
  let executor = Executor::new(
    Arc::new(PgTaskStore::new(db_pool)),
    queue.clone(),
    collaborators,
    config.executor_config(),
  );

  let pool = WorkerPool::new(Arc::new(executor), queue, config.worker_config());
  pool
    .run(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("Shutdown signal received");
    })
    .await?;
  Ok(())
}
