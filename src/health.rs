//! HTTP liveness endpoint (spec.md §4.7, §9): a second `Worker` alongside
//! the SMTP fleet, so an external monitor has something to poll regardless
//! of SMTP listener state.

use crate::error::{GatewayError, Result};
use crate::process::Worker;
use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_PORT: u16 = 3000;

pub struct HealthServer {
    port: u16,
}

impl HealthServer {
    pub fn new(port: Option<u16>) -> Self {
        HealthServer {
            port: port.unwrap_or(DEFAULT_PORT),
        }
    }
}

async fn root() -> &'static str {
    debug!(path = "/", status = 200, "health check");
    "OK"
}

#[async_trait]
impl Worker for HealthServer {
    fn name(&self) -> &str {
        "HTTP"
    }

    async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let router = Router::new().route("/", get(root));

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| GatewayError::Bind {
                uri: format!("http://0.0.0.0:{}", self.port),
                source: e,
            })?;

        info!(port = self.port, "HTTP health server started");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(GatewayError::Io)?;

        debug!("HTTP health server shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_3000_when_unconfigured() {
        let server = HealthServer::new(None);
        assert_eq!(server.port, DEFAULT_PORT);
    }

    #[tokio::test]
    async fn serves_ok_on_root_and_shuts_down_on_cancel() {
        // Bind manually (rather than through serve()) so the test can
        // learn the OS-assigned port before connecting to it.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/", get(root));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel_clone.cancelled().await })
                .await
                .unwrap();
        });

        let response = get_root(addr.port()).await;
        assert_eq!(response, "OK");

        cancel.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }

    async fn get_root(port: u16) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.lines().last().unwrap_or("").to_string()
    }
}
