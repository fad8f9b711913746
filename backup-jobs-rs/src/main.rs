mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::models::job::SqliteJobRegistry;
use crate::services::job_adopter::start_job_adopter;
use crate::state::AppState;
use crate::ws::ui::start_event_forwarder;
use backup_engine::catalog::{Catalog, MemCatalog};
use backup_engine::jobs::JobRegistry;
use backup_engine::kv::memory::MemKv;
use backup_engine::kv::KvStore;
use backup_engine::storage::StorageFactory;
use backup_engine::JobService;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    tracing::info!("Starting job server on port {} (node {})", config.port, config.node_id);

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.external_io_dir)?;

    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool, &config.data_dir)?;

    // Standalone node: the key space and catalog live in this process.
    let engine_config = config.engine()?;
    let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let catalog: Arc<dyn Catalog> = Arc::new(MemCatalog::new());
    let registry: Arc<dyn JobRegistry> = Arc::new(SqliteJobRegistry::new(pool.clone()));
    let storage = Arc::new(StorageFactory::new(&engine_config.node.external_io_dir));
    let service = JobService::new(kv, catalog, storage, registry, engine_config);

    let state = Arc::new(AppState::new(pool, config.clone(), service));

    let cancel = CancellationToken::new();
    start_event_forwarder(state.service.subscribe(), state.ui.clone(), cancel.clone());
    start_job_adopter(state.clone(), cancel.clone());

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    // Jobs still running keep their lease until it expires; another node
    // (or this one after a restart) adopts them.
    let running = state.service.running_jobs().await;
    if running > 0 {
        tracing::warn!("{} job(s) still running at shutdown", running);
    }

    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
