//! Configuration module for JobMonitor.
//!
//! Loads an optional TOML file, then applies environment overrides.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::{ProbeKind, Target, DEFAULT_TIMEOUT_SECS};

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A remote JobMonitor instance whose data is merged into the cluster view.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    /// Bearer token sent with every request to this peer.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Connectivity probe settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub enabled: bool,
    /// host or host:port; port 53 is assumed when omitted.
    pub target: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: "1.1.1.1".to_string(),
            interval_seconds: 60,
            timeout_seconds: 4,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Directory holding the history files (default: "data")
    pub data_dir: PathBuf,
    pub node_id: String,
    pub node_name: String,
    /// Minutes between probe rounds (default: 5)
    pub interval_minutes: u32,
    /// Seconds between peer refreshes (default: 60, floor 15)
    pub peer_refresh_seconds: u64,
    /// Maximum history entries requested from each peer.
    pub peer_history_limit: usize,
    /// When set, `/api/node/*` requires this bearer token.
    pub api_key: Option<String>,
    pub targets: Vec<Target>,
    pub peers: Vec<PeerConfig>,
    pub connectivity: ConnectivityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let host = env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "jobmonitor-local".to_string());
        Self {
            http_port: 8080,
            data_dir: PathBuf::from("data"),
            node_id: host.clone(),
            node_name: host,
            interval_minutes: 5,
            peer_refresh_seconds: 60,
            peer_history_limit: 10_000,
            api_key: None,
            targets: vec![Target {
                id: "example".to_string(),
                name: "Example Service".to_string(),
                kind: ProbeKind::Http,
                url: Some("https://example.com".to_string()),
                ..Default::default()
            }],
            peers: Vec::new(),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the file named by `JOBMONITOR_CONFIG`
    /// (default: "config.toml") and the environment.
    ///
    /// A missing file yields the defaults. Environment variables:
    /// - `JOBMONITOR_HTTP_PORT`: HTTP port
    /// - `JOBMONITOR_DATA_DIR`: history directory
    /// - `JOBMONITOR_NODE_ID` / `JOBMONITOR_NODE_NAME`: node identity
    /// - `JOBMONITOR_API_KEY`: bearer token protecting the node API
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("JOBMONITOR_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.apply_env();
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a TOML file, falling back to defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut cfg: Self = toml::from_str(content)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(port_str) = env::var("JOBMONITOR_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                self.http_port = port;
            }
        }

        if let Ok(dir) = env::var("JOBMONITOR_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(id) = env::var("JOBMONITOR_NODE_ID") {
            self.node_id = id;
        }

        if let Ok(name) = env::var("JOBMONITOR_NODE_NAME") {
            self.node_name = name;
        }

        if let Ok(key) = env::var("JOBMONITOR_API_KEY") {
            self.api_key = Some(key);
        }
    }

    /// Replace empty or non-positive values with their defaults.
    fn normalize(&mut self) {
        let defaults = Self::default();
        if self.interval_minutes == 0 {
            self.interval_minutes = defaults.interval_minutes;
        }
        if self.data_dir.as_os_str().is_empty() {
            self.data_dir = defaults.data_dir;
        }
        if self.node_id.trim().is_empty() {
            self.node_id = defaults.node_id;
        }
        if self.node_name.trim().is_empty() {
            self.node_name = self.node_id.clone();
        }
        if self.peer_refresh_seconds == 0 {
            self.peer_refresh_seconds = defaults.peer_refresh_seconds;
        }
        if self.peer_history_limit == 0 {
            self.peer_history_limit = defaults.peer_history_limit;
        }
        if self.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            self.api_key = None;
        }
        for target in &mut self.targets {
            if target.timeout_seconds == 0 {
                target.timeout_seconds = DEFAULT_TIMEOUT_SECS;
            }
        }
        if self.connectivity.interval_seconds == 0 {
            self.connectivity.interval_seconds = 60;
        }
        if self.connectivity.timeout_seconds == 0 {
            self.connectivity.timeout_seconds = 4;
        }
        if self.connectivity.target.trim().is_empty() {
            self.connectivity.target = ConnectivityConfig::default().target;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid(
                "configuration must define at least one target".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, target) in self.targets.iter().enumerate() {
            let id = target.id.trim();
            if id.is_empty() {
                return Err(ConfigError::Invalid(format!("target {} is missing id", i)));
            }
            if !seen.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate target id {}", id)));
            }
            let param = match target.kind {
                ProbeKind::Http => &target.url,
                ProbeKind::Tcp => &target.address,
            };
            if param.as_deref().map_or(true, |p| p.trim().is_empty()) {
                let field = match target.kind {
                    ProbeKind::Http => "url",
                    ProbeKind::Tcp => "address",
                };
                return Err(ConfigError::Invalid(format!(
                    "target {} requires {}",
                    id, field
                )));
            }
        }

        for (i, peer) in self.peers.iter().enumerate() {
            if !peer.enabled {
                continue;
            }
            if peer.id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("peer {} is missing id", i)));
            }
            if peer.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "peer {} base_url is required",
                    peer.id
                )));
            }
        }

        Ok(())
    }

    pub fn status_history_path(&self) -> PathBuf {
        self.data_dir.join("status_history.json")
    }

    pub fn connectivity_history_path(&self) -> PathBuf {
        self.data_dir.join("connectivity_history.json")
    }
}

fn default_true() -> bool {
    true
}
