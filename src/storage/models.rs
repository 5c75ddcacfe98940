//! Monitoring data model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default probe timeout in seconds when a target does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// How a target is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Http,
    Tcp,
}

/// A monitored entity, built from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ProbeKind,
    /// URL for `http` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// host:port for `tcp` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: ProbeKind::Http,
            url: None,
            address: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Target {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        let name = self.name.trim();
        if name.is_empty() {
            self.id.trim()
        } else {
            name
        }
    }
}

/// Outcome of probing one target at one tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// All checks collected at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// Outcome of one connectivity probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub target: String,
    pub ok: bool,
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Anything stored in an append-only series.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for StatusEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for ConnectivityStatus {
    fn timestamp(&self) -> DateTime<Utc> {
        self.checked_at
    }
}
