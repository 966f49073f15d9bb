use std::sync::Arc;

use anyhow::Context;
use dtsched::config::Config;
use dtsched::database::setup_database;
use dtsched::routes::{AppState, routes};
use dtsched::store::PgTaskStore;
use dtsched::telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url, config.db_max_connections)
    .await
    .context("Failed to set up database")?;

  let state = AppState {
    store: Arc::new(PgTaskStore::new(db_pool)),
    report_dir: config.report_dir.clone(),
  };

  let (addr, server) = warp::serve(routes(state)).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
  });
  info!(%addr, "API listening");
  server.await;
  Ok(())
}
