//! Per-listener accept loop (spec.md §4.5, §5).
//!
//! Binds one socket for one [`ListenerUri`], accepts connections (TLS
//! listeners complete an implicit handshake before any SMTP bytes are
//! read), checks the whitelist, enforces the per-listener connection cap,
//! and spawns one task per accepted session.

use crate::error::{GatewayError, Result};
use crate::smtp::session::{ConnectionCounter, SessionConfig, SmtpSession, SmtpStream};
use crate::uri::{ListenerUri, Transport};
use crate::whitelist::Whitelist;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period given to in-flight sessions after cancellation before the
/// listener's own accept loop returns (spec.md §5 suggests 1-5s).
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

pub struct Server {
    uri: ListenerUri,
    config: Arc<SessionConfig>,
    whitelist: Arc<Whitelist>,
    connections: Arc<ConnectionCounter>,
}

impl Server {
    pub fn new(uri: ListenerUri, config: Arc<SessionConfig>, whitelist: Arc<Whitelist>) -> Result<Self> {
        if (uri.transport == Transport::Tls || uri.transport == Transport::StartTls) && config.tls_bundle.is_none() {
            return Err(GatewayError::Config(format!(
                "listener {uri} requires TLS configuration, but none is set"
            )));
        }

        Ok(Server {
            uri,
            config,
            whitelist,
            connections: ConnectionCounter::new(),
        })
    }

    pub fn uri(&self) -> &ListenerUri {
        &self.uri
    }

    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.uri.address())
            .await
            .map_err(|e| GatewayError::Bind {
                uri: self.uri.to_string(),
                source: e,
            })?;

        info!(listener = %self.uri, "SMTP server started");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => self.spawn_session(socket, peer_addr),
                        Err(e) => error!(listener = %self.uri, error = %e, "failed to accept connection"),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(listener = %self.uri, "stopping SMTP server");
                    break;
                }
            }
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        debug!(listener = %self.uri, "SMTP server shut down");
        Ok(())
    }

    fn spawn_session(&self, socket: tokio::net::TcpStream, peer_addr: std::net::SocketAddr) {
        debug!(listener = %self.uri, remote_ip = %peer_addr.ip(), "new SMTP connection");

        if !self.whitelist.allows(peer_addr.ip()) {
            debug!(listener = %self.uri, remote_ip = %peer_addr.ip(), "IP not included in whitelist, access denied");
            tokio::spawn(deny(socket));
            return;
        }

        if !self.config.limits.unlimited_connections()
            && self.connections.count() as i64 >= self.config.limits.max_connections
        {
            warn!(listener = %self.uri, remote_ip = %peer_addr.ip(), "too many connections");
            tokio::spawn(reject_too_many(socket));
            return;
        }

        let config = self.config.clone();
        let connections = self.connections.clone();
        let transport = self.uri.transport;
        let uri = self.uri.to_string();

        tokio::spawn(async move {
            let _guard = connections.acquire();

            let stream = match transport {
                Transport::Plain | Transport::StartTls => SmtpStream::Plain(socket),
                Transport::Tls => {
                    let Some(bundle) = config.tls_bundle.clone() else {
                        error!(listener = uri, "TLS listener missing TLS bundle at accept time");
                        return;
                    };
                    match bundle.acceptor().accept(socket).await {
                        Ok(tls) => SmtpStream::Tls(Box::new(tls)),
                        Err(e) => {
                            warn!(listener = uri, remote_ip = %peer_addr.ip(), error = %e, "implicit TLS handshake failed");
                            return;
                        }
                    }
                }
            };

            let session = SmtpSession::new(config, peer_addr);
            if let Err(e) = session.handle(stream).await {
                warn!(listener = uri, remote_ip = %peer_addr.ip(), error = %e, "session ended with error");
            }
        });
    }
}

async fn deny(mut socket: tokio::net::TcpStream) {
    let _ = socket.write_all(b"421 Denied\r\n").await;
    let _ = socket.shutdown().await;
}

async fn reject_too_many(mut socket: tokio::net::TcpStream) {
    let _ = socket.write_all(b"421 Too many connections\r\n").await;
    let _ = socket.shutdown().await;
}
