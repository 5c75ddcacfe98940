//! TCP connect probe implementation.

use super::ProbeError;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Open a TCP connection to `address` (host:port) and close it again.
///
/// Returns the time taken to connect.
pub async fn run_tcp_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    if address.trim().is_empty() {
        return Err(ProbeError::Config("missing address".to_string()));
    }

    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            let elapsed = start.elapsed();
            drop(stream);
            Ok(elapsed)
        }
        Ok(Err(e)) => Err(ProbeError::Network(format!("failed to connect: {}", e))),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(run_tcp_probe(&addr, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_missing_address() {
        let err = run_tcp_probe(" ", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
