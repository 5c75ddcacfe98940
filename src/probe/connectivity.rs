//! Network reachability probe: a TCP dial to a DNS endpoint.

use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::run_tcp_probe;
use crate::storage::ConnectivityStatus;

const DEFAULT_DNS_PORT: u16 = 53;

/// Normalize a connectivity target to host:port, assuming port 53.
pub fn connectivity_address(target: &str) -> String {
    let target = target.trim();
    if let Ok(ip) = target.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_DNS_PORT).to_string();
    }
    if target.parse::<SocketAddr>().is_ok() || target.contains(':') {
        return target.to_string();
    }
    format!("{}:{}", target, DEFAULT_DNS_PORT)
}

/// Dial `target` once and record the outcome.
pub async fn probe_connectivity(target: &str, timeout: Duration) -> ConnectivityStatus {
    let address = connectivity_address(target);
    let target = target.trim().to_string();
    let result = run_tcp_probe(&address, timeout).await;
    let checked_at = Utc::now();
    match result {
        Ok(latency) => ConnectivityStatus {
            target,
            ok: true,
            latency_ms: latency.as_millis() as i64,
            error: None,
            checked_at,
        },
        Err(e) => ConnectivityStatus {
            target,
            ok: false,
            latency_ms: 0,
            error: Some(e.to_string()),
            checked_at,
        },
    }
}
