//! Refdata Server - Main entry point

use anyhow::Result;
use refdata_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::{info, warn};

use refdata_server::{
    config::Config,
    features,
    ingest::{HttpFetcher, PgStore, Scheduler, SyncStatusService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::default()
        .with_prefix("refdata-server")
        .with_filter("refdata_server=debug,tower_http=debug,sqlx=warn")
        .merge_env()?;

    init_logging(&log_config)?;

    info!("Starting Refdata Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    let store = Arc::new(PgStore::new(db_pool));
    let fetcher = Arc::new(HttpFetcher::new(&config.ingest)?);
    let scheduler = Scheduler::new(store.clone(), fetcher, config.ingest.clone());

    if config.ingest.enabled {
        scheduler.start().await?;
        info!("Sync scheduler started");
    } else {
        info!("Ingestion is disabled (INGEST_ENABLED=false); manual triggers remain available");
    }

    let service = Arc::new(SyncStatusService::new(store, scheduler.clone()));
    let app = features::app(service);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight runs stop at their next batch boundary
    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    if tokio::time::timeout(timeout, scheduler.stop()).await.is_err() {
        warn!(
            "Ingestion runs did not settle within {} seconds; their jobs are recovered on next start",
            timeout.as_secs()
        );
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
