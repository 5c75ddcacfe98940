//! Probe module for service monitoring.
//!
//! Supports HTTP and TCP probes, plus the TCP dial used for connectivity.

mod connectivity;
mod http;
mod tcp;

pub use connectivity::*;
pub use http::*;
pub use tcp::*;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{Check, ProbeKind, Target};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request timed out")]
    Timeout(Duration),
    #[error("{0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Something that can turn a target into a check.
///
/// Failures are data: implementations report them as a not-ok [`Check`]
/// instead of returning an error.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, target: &Target) -> impl Future<Output = Check> + Send;
}

/// Default prober running HTTP and TCP probes.
#[derive(Clone)]
pub struct TargetProber {
    client: reqwest::Client,
}

impl TargetProber {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("jobmonitor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Prober for TargetProber {
    async fn probe(&self, target: &Target) -> Check {
        // Add jitter to avoid thundering herd
        let jitter = rand::random::<u64>() % 100;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let timeout = Duration::from_secs(target.timeout_seconds.max(1));
        let mut check = Check {
            id: target.id.clone(),
            name: target.display_name().to_string(),
            ..Default::default()
        };

        match target.kind {
            ProbeKind::Http => {
                let url = target.url.as_deref().unwrap_or_default();
                match run_http_probe(&self.client, url, timeout).await {
                    Ok(response) => {
                        check.latency_ms = Some(millis(response.latency));
                        check.status_code = Some(response.status);
                        check.ok = response.is_success();
                        if !check.ok {
                            check.error = Some(response.describe());
                        }
                    }
                    Err(e) => check.error = Some(e.to_string()),
                }
            }
            ProbeKind::Tcp => {
                let address = target.address.as_deref().unwrap_or_default();
                match run_tcp_probe(address, timeout).await {
                    Ok(latency) => {
                        check.latency_ms = Some(millis(latency));
                        check.ok = true;
                    }
                    Err(e) => check.error = Some(e.to_string()),
                }
            }
        }

        check.state = if check.ok { "active" } else { "failed" }.to_string();
        if let Some(err) = &check.error {
            tracing::debug!("Probe {} failed: {}", target.id, err);
        }
        check
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
