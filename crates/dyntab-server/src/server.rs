//! Server lifecycle: open, run workers, shut down.

use std::future::Future;
use std::sync::Arc;

use dyntab_core::Database;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::Error;
use crate::status::StatusTask;

/// Open the database, run schema job workers until `shutdown` resolves,
/// then stop the workers and flush.
///
/// Opening and closing run on the blocking pool: engines may block on
/// their own runtime.
pub async fn run<F>(config: ServerConfig, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let database_config = config.database_config()?;
    info!(data_path = %config.data_path.display(), workers = config.workers, "opening database");
    let database = Arc::new(tokio::task::spawn_blocking(move || Database::open(database_config)).await??);

    let workers = database.start_workers()?;
    let status = config
        .status_interval
        .map(|interval| StatusTask::start(database.clone(), interval));
    info!(pending_jobs = database.queue().pending_count(), "server ready");

    shutdown.await;
    info!("shutting down");

    if let Some(status) = status {
        status.join().await;
    }
    tokio::task::spawn_blocking(move || {
        workers.stop();
        database.flush()
    })
    .await??;

    info!("server shutdown complete");
    Ok(())
}
