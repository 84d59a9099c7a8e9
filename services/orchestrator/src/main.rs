//! minerd
//!
//! Multi-tenant orchestrator for miner containers. Serves the tenant
//! API, supervises containers through the Docker Engine socket, and
//! reconciles actual state to the store in the background.

use std::sync::Arc;

use anyhow::{Context, Result};
use minerd_orchestrator::{
    api,
    config::Config,
    lifecycle::LifecycleManager,
    ports::PortAllocator,
    reconciler::{Reconciler, ReconcilerSettings},
    routing::RoutingTable,
    runtime::DockerRuntime,
    state::AppState,
    store::StateStore,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MINERD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting minerd orchestrator");
    info!(listen_addr = %config.listen_addr, data_dir = %config.data_dir.display(),
        "Configuration loaded");

    // Open the state store
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = Arc::new(
        StateStore::open(config.store_path())
            .with_context(|| format!("opening state store {}", config.store_path().display()))?,
    );
    info!(path = %config.store_path().display(), "State store opened");

    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_end,
    ));
    let runtime = Arc::new(DockerRuntime::new(
        config.docker_socket.to_string_lossy().into_owned(),
        config.runtime_timeout,
        config.image_overrides.clone(),
    ));
    let routes = Arc::new(RoutingTable::new());

    // Startup reconciliation runs to completion before the API serves,
    // so no request ever acts on records the last run left behind.
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        ports.clone(),
        runtime.clone(),
        routes.clone(),
        ReconcilerSettings {
            interval: config.reconcile_interval,
            provisioning_timeout: config.provisioning_timeout,
            stop_grace: config.stop_grace,
            max_restarts: config.max_restarts,
            orphan_policy: config.orphan_policy,
        },
    ));
    if let Err(e) = reconciler.startup().await {
        error!(error = %e, "Startup reconciliation failed");
        return Err(anyhow::anyhow!(e));
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic reconciliation in the background
    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let lifecycle = LifecycleManager::new(
        store.clone(),
        ports,
        runtime,
        routes.clone(),
        config.stop_grace,
        config.max_instances_per_tenant,
    );
    let state = AppState::new(lifecycle, routes, store);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
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

    // Wait for shutdown signal (Ctrl+C)
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

    // Signal shutdown to the reconciler
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, reconciler_handle)
        .await
        .is_err()
    {
        error!("Reconciler did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
