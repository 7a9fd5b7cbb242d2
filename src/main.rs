use std::sync::Arc;

use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use db_backup_orchestrator::api;
use db_backup_orchestrator::config::BackupConfig;
use db_backup_orchestrator::database::state::SqliteStateStore;
use db_backup_orchestrator::database::{BackupOrchestrator, Result};
use db_backup_orchestrator::db;

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("backup orchestrator stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = BackupConfig::from_env()?;
    config.ensure_scratch_dir()?;

    // Initialize the shared state database
    let pool = db::init_state_db(&config.state_database_url).await?;
    let state = Arc::new(SqliteStateStore::new(pool, config.history_limit));

    let api_addr = config.api_addr.clone();
    let orchestrator = Arc::new(BackupOrchestrator::from_config(config, state)?);
    orchestrator.start().await;

    let app = api::router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!(addr = %api_addr, "backup API listening");

    let shutdown = {
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutdown requested");
            orchestrator.stop().await;
        }
    };

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;

    // Let scheduled runs record themselves and release the lock before exit
    orchestrator.shutdown().await;
    info!("backup orchestrator stopped");

    served?;
    Ok(())
}
