//! Cluster wire types and snapshot models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::{ServiceTimeline, TimelinePoint};
use crate::metrics::ServiceUptime;
use crate::storage::{ConnectivityStatus, StatusEntry, Target};

/// Identity of a JobMonitor instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub interval_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity_interval_seconds: Option<u64>,
}

/// Payload of `GET /api/node/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<ConnectivityStatus>,
    #[serde(default)]
    pub targets: Vec<Target>,
    pub generated_at: DateTime<Utc>,
}

/// Payload of `GET /api/node/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHistoryResponse {
    pub node: Node,
    #[serde(default)]
    pub history: Vec<StatusEntry>,
    #[serde(default)]
    pub connectivity: Vec<ConnectivityStatus>,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub range: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

/// Where a node snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Peer,
}

/// Everything known about one node, scoped to the snapshot window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<ConnectivityStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StatusEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectivity_history: Vec<ConnectivityStatus>,
    /// Samples shortly before the window that seed connectivity holdover.
    #[serde(skip)]
    pub connectivity_lead_in: Vec<ConnectivityStatus>,
    #[serde(default)]
    pub services: Vec<ServiceUptime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_timelines: Vec<ServiceTimeline>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectivity_timeline: Vec<TimelinePoint>,
    /// Last refresh attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source: Source,
}

impl PeerSnapshot {
    /// A node with nothing but its identity.
    pub fn identity(node: Node, source: Source) -> Self {
        Self {
            node,
            status: None,
            connectivity: None,
            history: Vec::new(),
            connectivity_history: Vec::new(),
            connectivity_lead_in: Vec::new(),
            services: Vec::new(),
            targets: Vec::new(),
            service_timelines: Vec::new(),
            connectivity_timeline: Vec::new(),
            updated_at: None,
            last_success: None,
            error: None,
            source,
        }
    }
}

/// Merged view of the local node and every enabled peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub generated_at: DateTime<Utc>,
    pub range: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    /// Local node first, then peers in configured order.
    pub nodes: Vec<PeerSnapshot>,
}
