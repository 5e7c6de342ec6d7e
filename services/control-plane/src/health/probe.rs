//! Health probe workers.
//!
//! One probe is a single TCP connect or HTTP/1.1 GET against a task
//! endpoint, bounded by the check's per-probe timeout. Probes carry no
//! state; the supervisor folds their outcomes.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { cause: String },
}

impl ProbeOutcome {
    fn unhealthy(cause: impl Into<String>) -> Self {
        Self::Unhealthy {
            cause: cause.into(),
        }
    }
}

/// TCP probe: a successful connect within the timeout is healthy.
pub async fn check_tcp(addr: &str, check_timeout: Duration) -> ProbeOutcome {
    match timeout(check_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!(%addr, "tcp health probe succeeded");
            ProbeOutcome::Healthy
        }
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "tcp health probe failed: connection error");
            ProbeOutcome::unhealthy(format!("connection error: {e}"))
        }
        Err(_) => {
            debug!(%addr, "tcp health probe failed: timeout");
            ProbeOutcome::unhealthy("connect timeout")
        }
    }
}

/// HTTP probe: a 2xx status line within the timeout is healthy.
pub async fn check_http(addr: &str, path: &str, check_timeout: Duration) -> ProbeOutcome {
    let mut stream = match timeout(check_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%addr, path, error = %e, "http health probe failed: connection error");
            return ProbeOutcome::unhealthy(format!("connection error: {e}"));
        }
        Err(_) => {
            debug!(%addr, path, "http health probe failed: connect timeout");
            return ProbeOutcome::unhealthy("connect timeout");
        }
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    if let Err(e) = stream.write_all(request.as_bytes()).await {
        debug!(%addr, path, error = %e, "http health probe failed: write error");
        return ProbeOutcome::unhealthy(format!("write error: {e}"));
    }

    let mut response = vec![0u8; 1024];
    match timeout(check_timeout, stream.read(&mut response)).await {
        Ok(Ok(n)) if n > 0 => {
            let response = String::from_utf8_lossy(&response[..n]);
            if let Some(status_line) = response.lines().next() {
                if status_line.contains(" 2") {
                    debug!(%addr, path, status = %status_line, "http health probe succeeded");
                    return ProbeOutcome::Healthy;
                }
                debug!(%addr, path, status = %status_line, "http health probe failed: non-2xx");
                return ProbeOutcome::unhealthy(format!("non-2xx status: {status_line}"));
            }
            ProbeOutcome::unhealthy("malformed response")
        }
        Ok(Ok(_)) => ProbeOutcome::unhealthy("empty response"),
        Ok(Err(e)) => ProbeOutcome::unhealthy(format!("read error: {e}")),
        Err(_) => ProbeOutcome::unhealthy("read timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_no_listener() {
        let outcome = check_tcp("127.0.0.1:1", Duration::from_millis(100)).await;
        assert!(matches!(outcome, ProbeOutcome::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn test_http_probe_no_listener() {
        let outcome = check_http("127.0.0.1:1", "/health", Duration::from_millis(100)).await;
        assert!(matches!(outcome, ProbeOutcome::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn test_tcp_probe_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let outcome = check_tcp(&addr, Duration::from_millis(500)).await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_http_probe_reads_status_line() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let outcome = check_http(&addr, "/ping", Duration::from_millis(500)).await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_http_probe_non_2xx_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
                .await
                .unwrap();
        });

        let outcome = check_http(&addr, "/ping", Duration::from_millis(500)).await;
        assert!(matches!(outcome, ProbeOutcome::Unhealthy { cause } if cause.contains("503")));
    }
}
