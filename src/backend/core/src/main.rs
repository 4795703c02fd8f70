//! LabKit Server - Main entry point

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use labkit_core::{
    api::{self, AppState},
    components::ComponentRegistry,
    config::Config,
    jobs::{JobContext, JobService},
    store::{InMemoryRecordStore, PgRecordStore, RecordStore},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "labkit-server", version, about = "LabKit job execution server")]
struct Args {
    /// Configuration file; environment variables override it
    #[arg(short, long, env = "LABKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Keep records in memory instead of PostgreSQL
    #[arg(long, env = "LABKIT_IN_MEMORY")]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_logging(&config.logging)?;
    let metrics = telemetry::init_metrics(&config.metrics, "labkit-server")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting LabKit Server");

    config.storage.ensure_dirs()?;

    let store: Arc<dyn RecordStore> = if args.in_memory {
        tracing::warn!("Using the in-memory record store; records are lost on exit");
        Arc::new(InMemoryRecordStore::new())
    } else {
        let store = PgRecordStore::connect(&config.database).await?;
        if config.database.run_migrations {
            store.migrate().await?;
        }
        tracing::info!("Connected to database");
        Arc::new(store)
    };

    let registry = Arc::new(ComponentRegistry::with_defaults());
    let ctx = JobContext::new(store, registry, config.storage.clone());
    let jobs = Arc::new(JobService::new(ctx, &config.queue));
    if config.queue.autostart {
        jobs.start_loop(config.queue.stop_when_empty);
    }

    let app = api::build_router(AppState {
        jobs: Arc::clone(&jobs),
        metrics,
    });

    let addr = config.bind_addr();
    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    jobs.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
