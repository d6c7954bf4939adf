//! DYNTAB Server - Standalone schema job runner.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dyntab_server::{run, Args};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dyntab_server=info,dyntab_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting DYNTAB server");

    let args = Args::parse();
    let config = args.into_config();

    tracing::info!(
        data_path = %config.data_path.display(),
        sqlite_path = ?config.sqlite_path,
        postgres = config.postgres_url.is_some(),
        workers = config.workers,
        "configuration loaded"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
        tracing::info!("received shutdown signal");
    };

    if let Err(e) = run(config, shutdown).await {
        tracing::error!(error = %e, "server error");
        return Err(e.into());
    }
    Ok(())
}
