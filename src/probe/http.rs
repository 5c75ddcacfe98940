//! HTTP probe implementation.

use super::ProbeError;
use std::time::{Duration, Instant};

/// Status and timing of one HTTP probe.
#[derive(Debug, Clone, Copy)]
pub struct HttpResponse {
    pub status: u16,
    pub latency: Duration,
}

impl HttpResponse {
    /// 2xx and 3xx count as healthy.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn describe(&self) -> String {
        match reqwest::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
        {
            Some(reason) => format!("HTTP {} {}", self.status, reason),
            None => format!("HTTP {}", self.status),
        }
    }
}

/// Run an HTTP GET against `address` using the shared client.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    timeout: Duration,
) -> Result<HttpResponse, ProbeError> {
    if address.trim().is_empty() {
        return Err(ProbeError::Config("missing url".to_string()));
    }
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let start = Instant::now();

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let _body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    Ok(HttpResponse {
        status,
        latency: start.elapsed(),
    })
}
