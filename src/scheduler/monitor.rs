//! Local probe loop: one status entry per tick.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::task::{stopped, BackgroundTask};
use crate::probe::Prober;
use crate::storage::{StatusEntry, StatusStore, StoreError, Target};

/// Periodically probes every target and appends the results to the store.
pub struct Monitor<P: Prober> {
    inner: Arc<MonitorInner<P>>,
    task: BackgroundTask,
}

struct MonitorInner<P> {
    prober: P,
    store: Arc<StatusStore>,
    targets: Vec<Target>,
    interval: Duration,
}

impl<P: Prober> Monitor<P> {
    pub fn new(prober: P, store: Arc<StatusStore>, targets: Vec<Target>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                prober,
                store,
                targets,
                interval: interval.max(Duration::from_secs(1)),
            }),
            task: BackgroundTask::new(),
        }
    }

    /// Start the loop. The first round runs immediately.
    pub fn start(&self) {
        let inner = self.inner.clone();
        if self.task.spawn(move |stop| inner.run(stop)) {
            tracing::info!(
                "Monitor started with {} targets every {:?}",
                self.inner.targets.len(),
                self.inner.interval
            );
        }
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Probe every target once and persist the resulting entry.
    pub async fn run_once(&self) -> Result<StatusEntry, StoreError> {
        self.inner.run_once().await
    }
}

impl<P: Prober> MonitorInner<P> {
    async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = stopped(&mut stop) => break,
                        result = self.run_once() => {
                            if let Err(e) = result {
                                tracing::error!("Monitor: failed to persist status: {}", e);
                            }
                        }
                    }
                }
            }
        }

        tracing::info!("Monitor stopped");
    }

    async fn run_once(&self) -> Result<StatusEntry, StoreError> {
        let timestamp = Utc::now();
        let mut checks = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            checks.push(self.prober.probe(target).await);
        }

        let entry = StatusEntry { timestamp, checks };
        let failing = entry.checks.iter().filter(|c| !c.ok).count();
        tracing::debug!(
            "Monitor: round complete, {} checks, {} failing",
            entry.checks.len(),
            failing
        );

        self.store.append(entry.clone())?;
        tracing::debug!("Monitor: stored entry #{}", self.store.version());
        Ok(entry)
    }
}
