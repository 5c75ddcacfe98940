//! Connectivity loop: dials the configured endpoint on a fixed cadence.

use std::sync::Arc;
use std::time::Duration;

use super::task::{stopped, BackgroundTask};
use crate::config::ConnectivityConfig;
use crate::probe::probe_connectivity;
use crate::storage::{ConnectivityStatus, ConnectivityStore, StoreError};

const MIN_MAX_SAMPLES: usize = 2048;
const MAX_MAX_SAMPLES: usize = 100_000;

/// Number of samples kept so 30 days of history fit at `interval`.
pub fn connectivity_capacity(interval: Duration) -> usize {
    let secs = interval.as_secs().max(1);
    let per_month = (30 * 24 * 3600 / secs) as usize + 128;
    per_month.clamp(MIN_MAX_SAMPLES, MAX_MAX_SAMPLES)
}

/// Records network reachability into a [`ConnectivityStore`].
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    store: Arc<ConnectivityStore>,
    task: BackgroundTask,
}

impl ConnectivityMonitor {
    pub fn new(config: ConnectivityConfig, store: Arc<ConnectivityStore>) -> Self {
        Self {
            config,
            store,
            task: BackgroundTask::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_seconds.max(1))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds.max(1))
    }

    /// Start the loop. A disabled monitor never spawns.
    pub fn start(&self) {
        if !self.config.enabled {
            tracing::info!("Connectivity monitor disabled");
            return;
        }

        let store = self.store.clone();
        let target = self.config.target.clone();
        let interval = self.interval();
        let timeout = self.timeout();

        if self.task.spawn(move |stop| run_loop(store, target, interval, timeout, stop)) {
            tracing::info!(
                "Connectivity monitor started for {} every {:?}",
                self.config.target,
                interval
            );
        }
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Probe once and persist the sample.
    pub async fn run_once(&self) -> Result<ConnectivityStatus, StoreError> {
        probe_once(&self.store, &self.config.target, self.timeout()).await
    }
}

async fn probe_once(
    store: &ConnectivityStore,
    target: &str,
    timeout: Duration,
) -> Result<ConnectivityStatus, StoreError> {
    let status = probe_connectivity(target, timeout).await;
    if let Some(err) = &status.error {
        tracing::debug!("Connectivity probe to {} failed: {}", target, err);
    }
    store.append(status.clone())?;
    Ok(status)
}

async fn run_loop(
    store: Arc<ConnectivityStore>,
    target: String,
    period: Duration,
    timeout: Duration,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = interval.tick() => {
                if let Err(e) = probe_once(&store, &target, timeout).await {
                    tracing::error!("Connectivity: failed to persist sample: {}", e);
                }
            }
        }
    }

    tracing::info!("Connectivity monitor stopped");
}
