//! Web server module.

mod handlers;
mod ws;

pub use handlers::*;
pub use ws::*;

use crate::cluster::ClusterAggregator;
use crate::config::ServerConfig;
use crate::overview::{build_overview, overview_window, OverviewSnapshot};
use crate::storage::{ConnectivityStore, StatusStore};

use axum::{routing::get, Router};
use chrono::Utc;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<StatusStore>,
    pub connectivity: Arc<ConnectivityStore>,
    pub cluster: Arc<ClusterAggregator>,
    /// Flips to `true` when the server shuts down.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn overview(&self, limit: usize) -> OverviewSnapshot {
        let now = Utc::now();
        let snapshot = self
            .cluster
            .snapshot_window(overview_window(now), "overview", now);
        build_overview(&snapshot, limit)
    }
}

/// Web server for JobMonitor.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Local node
            .route("/api/status", get(handlers::handle_status))
            .route("/api/history", get(handlers::handle_history))
            .route("/api/uptime", get(handlers::handle_uptime))
            .route("/api/timeline", get(handlers::handle_timeline))
            .route("/api/connectivity", get(handlers::handle_connectivity))
            // Peer protocol
            .route("/api/node/status", get(handlers::handle_node_status))
            .route("/api/node/history", get(handlers::handle_node_history))
            // Cluster views
            .route("/api/cluster", get(handlers::handle_cluster))
            .route("/api/overview", get(handlers::handle_overview))
            .route("/api/overview/ws", get(ws::handle_overview_ws))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}
