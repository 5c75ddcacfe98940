//! Peer polling and cluster snapshot assembly.

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::types::*;
use crate::config::{PeerConfig, ServerConfig};
use crate::history::{
    build_connectivity_timeline, build_service_timelines, DEFAULT_TIMELINE_POINTS,
    MAX_HOLDOVER_MINUTES,
};
use crate::metrics::compute_service_uptime;
use crate::scheduler::{stopped, BackgroundTask};
use crate::storage::{ConnectivityStatus, ConnectivityStore, StatusEntry, StatusStore, Target};
use crate::window::{RangeKey, Window};

/// Shortest allowed pause between two peer refresh cycles.
pub const MIN_REFRESH: Duration = Duration::from_secs(15);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer fetch error types.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer {0} has empty base_url")]
    MissingBaseUrl(String),
    #[error("{endpoint} fetch timed out")]
    Timeout { endpoint: &'static str },
    #[error("{endpoint} fetch failed: {reason}")]
    Unreachable {
        endpoint: &'static str,
        reason: String,
    },
    #[error("{endpoint} fetch failed: http {status}")]
    Status { endpoint: &'static str, status: u16 },
    #[error("{endpoint} returned an invalid payload: {reason}")]
    Protocol {
        endpoint: &'static str,
        reason: String,
    },
    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Tunables of the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub refresh: Duration,
    pub request_timeout: Duration,
    pub history_limit: usize,
}

impl AggregatorConfig {
    pub fn from_server(cfg: &ServerConfig) -> Self {
        Self {
            refresh: Duration::from_secs(cfg.peer_refresh_seconds),
            request_timeout: REQUEST_TIMEOUT,
            history_limit: cfg.peer_history_limit,
        }
    }
}

/// Raw data received from a peer on its last successful refresh.
#[derive(Debug, Clone)]
pub struct PeerData {
    pub node: Node,
    pub status: Option<StatusEntry>,
    pub connectivity: Option<ConnectivityStatus>,
    pub targets: Vec<Target>,
    pub history: Vec<StatusEntry>,
    /// The peer returned as many entries as were asked for, so older
    /// entries may exist that were never fetched.
    pub history_truncated: bool,
    pub connectivity_history: Vec<ConnectivityStatus>,
    pub fetched_at: DateTime<Utc>,
}

/// What the aggregator knows about a peer.
#[derive(Debug, Clone, Default)]
pub enum PeerState {
    /// Not refreshed yet.
    #[default]
    Unknown,
    Healthy(Arc<PeerData>),
    /// Last refresh failed; any earlier good data is kept.
    Degraded {
        last_good: Option<Arc<PeerData>>,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl PeerState {
    /// Fold one refresh outcome into the previous state.
    pub fn transition(self, result: Result<PeerData, PeerError>, now: DateTime<Utc>) -> Self {
        match result {
            Ok(data) => Self::Healthy(Arc::new(data)),
            Err(e) => {
                let last_good = match self {
                    Self::Unknown => None,
                    Self::Healthy(data) => Some(data),
                    Self::Degraded { last_good, .. } => last_good,
                };
                Self::Degraded {
                    last_good,
                    error: e.to_string(),
                    failed_at: now,
                }
            }
        }
    }

    pub fn last_good(&self) -> Option<&Arc<PeerData>> {
        match self {
            Self::Unknown => None,
            Self::Healthy(data) => Some(data),
            Self::Degraded { last_good, .. } => last_good.as_ref(),
        }
    }
}

/// Merges the local stores with periodically refreshed peer data.
pub struct ClusterAggregator {
    inner: Arc<Inner>,
    task: BackgroundTask,
}

struct Inner {
    node: Node,
    targets: Vec<Target>,
    status: Arc<StatusStore>,
    connectivity: Arc<ConnectivityStore>,
    peers: Vec<PeerConfig>,
    config: AggregatorConfig,
    client: reqwest::Client,
    states: RwLock<HashMap<String, PeerState>>,
}

impl ClusterAggregator {
    pub fn new(
        node: Node,
        targets: Vec<Target>,
        status: Arc<StatusStore>,
        connectivity: Arc<ConnectivityStore>,
        peers: Vec<PeerConfig>,
        mut config: AggregatorConfig,
    ) -> Result<Self, PeerError> {
        config.refresh = config.refresh.max(MIN_REFRESH);

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(config.request_timeout))
            .build()
            .map_err(|e| PeerError::Client(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                node,
                targets,
                status,
                connectivity,
                peers,
                config,
                client,
                states: RwLock::new(HashMap::new()),
            }),
            task: BackgroundTask::new(),
        })
    }

    /// Start the refresh loop. The first refresh runs immediately.
    pub fn start(&self) {
        let enabled = self.inner.peers.iter().filter(|p| p.enabled).count();
        if enabled == 0 {
            tracing::info!("Cluster: no peers configured");
            return;
        }

        let inner = self.inner.clone();
        if self.task.spawn(move |stop| inner.run(stop)) {
            tracing::info!(
                "Cluster: polling {} peers every {:?}",
                enabled,
                self.inner.config.refresh
            );
        }
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// Refresh every enabled peer once.
    pub async fn refresh(&self) {
        self.inner.refresh_all().await;
    }

    /// Current state of one peer.
    pub fn peer_state(&self, id: &str) -> PeerState {
        self.inner
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self, range: RangeKey) -> ClusterSnapshot {
        let now = Utc::now();
        self.snapshot_window(range.window(now), range.as_str(), now)
    }

    /// Build a cluster view scoped to `window`.
    ///
    /// Local data is read fresh from the stores; peer data comes from the
    /// cache and is re-filtered and re-aggregated here.
    pub fn snapshot_window(&self, window: Window, label: &str, now: DateTime<Utc>) -> ClusterSnapshot {
        let mut nodes = vec![self.inner.local_snapshot(&window, now)];

        let cached: Vec<(&PeerConfig, PeerState)> = {
            let states = self.inner.states.read().unwrap_or_else(|e| e.into_inner());
            self.inner
                .peers
                .iter()
                .filter(|p| p.enabled)
                .map(|p| (p, states.get(&p.id).cloned().unwrap_or_default()))
                .collect()
        };

        nodes.extend(
            cached
                .into_iter()
                .map(|(peer, state)| peer_snapshot(peer, &state, &window)),
        );

        ClusterSnapshot {
            generated_at: now,
            range: label.to_string(),
            range_start: window.start,
            range_end: window.end,
            nodes,
        }
    }

    /// Payload for `GET /api/node/status`.
    pub fn node_status(&self) -> NodeStatusResponse {
        NodeStatusResponse {
            node: self.inner.node.clone(),
            status: self.inner.status.latest(),
            connectivity: self.inner.connectivity.latest(),
            targets: self.inner.targets.clone(),
            generated_at: Utc::now(),
        }
    }

    /// Payload for `GET /api/node/history`; `limit` of zero means no cap.
    pub fn node_history(&self, range: RangeKey, limit: usize) -> NodeHistoryResponse {
        let now = Utc::now();
        let window = range.window(now);
        let history = limit_history(window.retain(self.inner.status.history_since(window.start)), limit);
        let connectivity = window.retain(self.inner.connectivity.history_since(window.start));
        NodeHistoryResponse {
            node: self.inner.node.clone(),
            history,
            connectivity,
            generated_at: now,
            range: range.as_str().to_string(),
            range_start: window.start,
            range_end: window.end,
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.refresh);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = stopped(&mut stop) => break,
                        _ = self.refresh_all() => {}
                    }
                }
            }
        }

        tracing::info!("Cluster: refresh loop stopped");
    }

    async fn refresh_all(self: &Arc<Self>) {
        let mut set = JoinSet::new();
        for peer in self.peers.iter().filter(|p| p.enabled) {
            let inner = self.clone();
            let peer = peer.clone();
            set.spawn(async move {
                let result = inner.fetch_peer(&peer).await;
                inner.record(&peer, result);
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Cluster: peer refresh task failed: {}", e);
            }
        }
    }

    fn record(&self, peer: &PeerConfig, result: Result<PeerData, PeerError>) {
        match &result {
            Ok(data) => tracing::debug!(
                "Cluster: refreshed peer {} ({} entries)",
                peer.id,
                data.history.len()
            ),
            Err(e) => tracing::warn!("Cluster: peer {} refresh failed: {}", peer.id, e),
        }

        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        let previous = states.remove(&peer.id).unwrap_or_default();
        states.insert(peer.id.clone(), previous.transition(result, Utc::now()));
    }

    async fn fetch_peer(&self, peer: &PeerConfig) -> Result<PeerData, PeerError> {
        let base = peer.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(PeerError::MissingBaseUrl(peer.id.clone()));
        }
        let api_key = peer.api_key.as_deref();

        let status: NodeStatusResponse = self
            .get_json(&format!("{}/api/node/status", base), api_key, "status")
            .await?;

        let history_url = format!(
            "{}/api/node/history?range={}&limit={}",
            base,
            RangeKey::Last30Days.as_str(),
            self.config.history_limit
        );
        let history: NodeHistoryResponse = self.get_json(&history_url, api_key, "history").await?;
        let limit = self.config.history_limit;
        let history_truncated = limit > 0 && history.history.len() >= limit;

        Ok(PeerData {
            node: Node {
                id: peer.id.clone(),
                name: resolve_name(&peer.name, &status.node.name, &peer.id),
                interval_minutes: status.node.interval_minutes,
                connectivity_interval_seconds: status.node.connectivity_interval_seconds,
            },
            status: status.status,
            connectivity: status.connectivity,
            targets: status.targets,
            history: limit_history(history.history, limit),
            history_truncated,
            connectivity_history: history.connectivity,
            fetched_at: Utc::now(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        api_key: Option<&str>,
        endpoint: &'static str,
    ) -> Result<T, PeerError> {
        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PeerError::Timeout { endpoint }
            } else {
                PeerError::Unreachable {
                    endpoint,
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PeerError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                PeerError::Timeout { endpoint }
            } else {
                PeerError::Protocol {
                    endpoint,
                    reason: e.to_string(),
                }
            }
        })
    }

    fn local_snapshot(&self, window: &Window, now: DateTime<Utc>) -> PeerSnapshot {
        let lead_in = window.start - chrono::Duration::minutes(MAX_HOLDOVER_MINUTES);
        let data = NodeData {
            node: self.node.clone(),
            status: self.status.latest(),
            connectivity: self.connectivity.latest(),
            targets: self.targets.clone(),
            history: self.status.history_since(window.start),
            coverage_start: None,
            connectivity_history: self.connectivity.history_since(lead_in),
        };
        let mut snap = data.assemble(window, Source::Local);
        snap.updated_at = Some(now);
        snap.last_success = Some(now);
        snap
    }
}

/// Inputs for one node snapshot, before window scoping.
struct NodeData {
    node: Node,
    status: Option<StatusEntry>,
    connectivity: Option<ConnectivityStatus>,
    targets: Vec<Target>,
    history: Vec<StatusEntry>,
    /// Oldest instant the history is known to cover, when it does not reach
    /// back to the window start.
    coverage_start: Option<DateTime<Utc>>,
    /// May start before the window; those samples only seed the timeline.
    connectivity_history: Vec<ConnectivityStatus>,
}

impl NodeData {
    fn from_peer(data: &PeerData, window: &Window) -> Self {
        let lead_in = window.start - chrono::Duration::minutes(MAX_HOLDOVER_MINUTES);
        Self {
            node: data.node.clone(),
            status: data.status.clone(),
            connectivity: data.connectivity.clone(),
            targets: data.targets.clone(),
            history: data
                .history
                .iter()
                .filter(|e| window.contains(e.timestamp))
                .cloned()
                .collect(),
            coverage_start: data
                .history_truncated
                .then(|| data.history.first().map(|e| e.timestamp))
                .flatten(),
            connectivity_history: data
                .connectivity_history
                .iter()
                .filter(|c| c.checked_at >= lead_in && c.checked_at <= window.end)
                .cloned()
                .collect(),
        }
    }

    fn assemble(self, window: &Window, source: Source) -> PeerSnapshot {
        let history = window.retain(self.history);
        let interval = chrono::Duration::minutes(i64::from(self.node.interval_minutes));
        // Unfetched entries are not missing ticks.
        let covered = match self.coverage_start {
            Some(start) if start > window.start => Window {
                start: start.min(window.end),
                end: window.end,
            },
            _ => *window,
        };
        let services = compute_service_uptime(&history, &self.targets, &covered, interval);
        let service_timelines = build_service_timelines(
            &history,
            self.status.as_ref(),
            &self.targets,
            window,
            DEFAULT_TIMELINE_POINTS,
        );

        let connectivity_timeline = if self.connectivity_history.is_empty() {
            Vec::new()
        } else {
            build_connectivity_timeline(&self.connectivity_history, window, DEFAULT_TIMELINE_POINTS)
        };
        let (connectivity_lead_in, connectivity_history): (Vec<_>, Vec<_>) = self
            .connectivity_history
            .into_iter()
            .filter(|c| c.checked_at <= window.end)
            .partition(|c| c.checked_at < window.start);

        PeerSnapshot {
            node: self.node,
            status: self.status,
            connectivity: self.connectivity,
            history,
            connectivity_history,
            connectivity_lead_in,
            services,
            targets: self.targets,
            service_timelines,
            connectivity_timeline,
            updated_at: None,
            last_success: None,
            error: None,
            source,
        }
    }
}

fn peer_snapshot(peer: &PeerConfig, state: &PeerState, window: &Window) -> PeerSnapshot {
    let identity = Node {
        id: peer.id.clone(),
        name: resolve_name(&peer.name, "", &peer.id),
        ..Default::default()
    };

    let mut snap = match state.last_good() {
        Some(data) => {
            let mut snap = NodeData::from_peer(data, window).assemble(window, Source::Peer);
            snap.updated_at = Some(data.fetched_at);
            snap.last_success = Some(data.fetched_at);
            snap
        }
        None => PeerSnapshot::identity(identity, Source::Peer),
    };

    if let PeerState::Degraded {
        error, failed_at, ..
    } = state
    {
        snap.error = Some(error.clone());
        snap.updated_at = Some(*failed_at);
    }
    snap
}

fn limit_history<T>(mut entries: Vec<T>, limit: usize) -> Vec<T> {
    if limit > 0 && entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    entries
}

fn resolve_name(configured: &str, remote: &str, fallback: &str) -> String {
    [configured, remote, fallback]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}
