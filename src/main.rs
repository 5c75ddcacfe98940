//! JobMonitor - service health monitoring with multi-node aggregation.

mod cluster;
mod config;
mod history;
mod metrics;
mod overview;
mod probe;
mod scheduler;
mod storage;
mod web;
mod window;

use cluster::{AggregatorConfig, ClusterAggregator, Node};
use config::ServerConfig;
use probe::TargetProber;
use scheduler::{connectivity_capacity, stopped, ConnectivityMonitor, Monitor};
use storage::{ConnectivityStore, StatusStore};
use web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("jobmonitor=info".parse()?))
        .init();

    // Load configuration
    let cfg = Arc::new(ServerConfig::load()?);
    tracing::info!(
        "Starting JobMonitor node {} ({}) on port {}...",
        cfg.node_id,
        cfg.node_name,
        cfg.http_port
    );
    tracing::info!("Using data directory {}", cfg.data_dir.display());

    // Open history files; a malformed file aborts startup.
    let store = Arc::new(StatusStore::open(cfg.status_history_path())?);
    let connectivity_interval = Duration::from_secs(cfg.connectivity.interval_seconds);
    let connectivity = Arc::new(
        ConnectivityStore::open(cfg.connectivity_history_path())?
            .with_max_entries(connectivity_capacity(connectivity_interval)),
    );
    tracing::info!(
        "Loaded {} status entries from {}",
        store.len(),
        store.path().display()
    );
    tracing::info!(
        "Loaded {} connectivity samples from {}",
        connectivity.len(),
        connectivity.path().display()
    );

    let node = Node {
        id: cfg.node_id.clone(),
        name: cfg.node_name.clone(),
        interval_minutes: cfg.interval_minutes,
        connectivity_interval_seconds: cfg
            .connectivity
            .enabled
            .then_some(cfg.connectivity.interval_seconds),
    };

    // Background loops
    let monitor = Monitor::new(
        TargetProber::new()?,
        store.clone(),
        cfg.targets.clone(),
        Duration::from_secs(u64::from(cfg.interval_minutes) * 60),
    );
    let connectivity_monitor = ConnectivityMonitor::new(cfg.connectivity.clone(), connectivity.clone());
    let cluster = Arc::new(ClusterAggregator::new(
        node,
        cfg.targets.clone(),
        store.clone(),
        connectivity.clone(),
        cfg.peers.clone(),
        AggregatorConfig::from_server(&cfg),
    )?);

    monitor.start();
    connectivity_monitor.start();
    cluster.start();

    // SIGINT or SIGTERM flips the shutdown channel; everything else watches it.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(signal) => {
                tracing::info!("Received {}, shutting down", signal);
                shutdown_tx.send_replace(true);
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
        // Dropping the sender would read as a shutdown.
        std::future::pending::<()>().await;
    });

    let server = Server::new(AppState {
        config: cfg.clone(),
        store,
        connectivity,
        cluster: cluster.clone(),
        shutdown: shutdown_rx.clone(),
    });

    let mut server_shutdown = shutdown_rx;
    let result = server
        .start(async move { stopped(&mut server_shutdown).await })
        .await;

    monitor.stop().await;
    connectivity_monitor.stop().await;
    cluster.stop().await;
    tracing::info!("JobMonitor stopped");

    result
}

/// Wait for Ctrl-C or, on Unix, SIGTERM. Returns the signal's name.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl-C")
}
