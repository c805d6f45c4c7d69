//! Fleet worker manager.
//!
//! Keeps worker pools sized to their pending demand: provisions workers
//! through the configured providers, registers them when they call in,
//! and reaps the ones that die or run out their lease.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_worker_manager::{
    api, config,
    demand::{DemandSignal, FixedDemand, QueueDemand},
    notify::LogNotifier,
    providers::{ProviderContext, Providers},
    provisioner::{Provisioner, ProvisionerWorker},
    registry::{Database, MemoryRegistry, Registry},
    scanner::PurgeWorker,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet worker manager");
    info!(listen_addr = %config.listen_addr, providers = config.providers.len(), "Configuration loaded");

    let registry: Arc<dyn Registry> = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Arc::new(db.registry())
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory registry");
            Arc::new(MemoryRegistry::new())
        }
    };

    let ctx = Arc::new(ProviderContext::new(registry, Arc::new(LogNotifier)));
    let providers = Arc::new(Providers::from_config(&config.providers)?);
    let ready = providers.prepare_all(&ctx).await;
    info!(ready, configured = config.providers.len(), "Providers prepared");

    let demand: Arc<dyn DemandSignal> = match &config.queue_url {
        Some(url) => Arc::new(QueueDemand::new(url.clone(), DEMAND_TIMEOUT)?),
        None => {
            warn!("FLEET_QUEUE_URL not set; pools only grow to their minimum capacity");
            Arc::new(FixedDemand::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let provisioner = Arc::new(Provisioner::new(
        ctx.clone(),
        providers.clone(),
        demand,
        config.provisioner.pool_budget,
    ));
    let provisioner_worker = ProvisionerWorker::new(provisioner, config.provisioner.interval);
    let provisioner_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            provisioner_worker.run(shutdown_rx).await;
        }
    });

    let purge_worker = PurgeWorker::new(ctx.clone(), config.purge.clone());
    let purge_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            purge_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(ctx, providers);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, provisioner_handle).await {
        warn!(error = %e, "Provisioner did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, purge_handle).await {
        warn!(error = %e, "Purge worker did not shut down in time");
    }

    info!("Worker manager shutdown complete");
    Ok(())
}
