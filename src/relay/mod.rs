//! Outbound relay client (spec.md §4.6).
//!
//! A fresh SMTP session is opened per inbound message; there is no
//! connection pooling. `RelayTarget` is built once at startup (and again on
//! reload) from `relay.outgoing_server`; `RelayClient` is the re-entrant
//! handle sessions call into after DATA completes.

use crate::error::{GatewayError, Result};
use crate::security::tls::TlsBundle;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::uri::Transport;

/// How the relay client authenticates to the upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAuthMethod {
    None,
    Plain,
    CramMd5,
}

impl RelayAuthMethod {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "plain" => RelayAuthMethod::Plain,
            "cram-md5" => RelayAuthMethod::CramMd5,
            _ => RelayAuthMethod::None,
        }
    }
}

/// Upstream coordinates the relay client connects to for every send.
///
/// An empty `host` puts the client into discard mode: `send` returns
/// success without opening a socket, useful for tests and for deployments
/// that only want the gateway's accept-side behaviour exercised.
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub auth_method: RelayAuthMethod,
    pub username: String,
    pub password: String,
    pub from_override: Option<String>,
    pub verify_tls: bool,
}

impl RelayTarget {
    /// "Accept and discard" mode: `host == ""`.
    pub fn discard() -> Self {
        RelayTarget {
            host: String::new(),
            port: 0,
            transport: Transport::Plain,
            auth_method: RelayAuthMethod::None,
            username: String::new(),
            password: String::new(),
            from_override: None,
            verify_tls: true,
        }
    }
}

/// Re-entrant outbound relay handle. Holds no mutable state, so concurrent
/// `send` calls never contend with each other.
pub struct RelayClient {
    target: RelayTarget,
}

impl RelayClient {
    pub fn new(target: RelayTarget) -> Self {
        RelayClient { target }
    }

    /// Relay one envelope to the upstream server.
    ///
    /// Any failure along the way is collapsed into a single
    /// `GatewayError::Relay`; the session layer maps that to a 554 reply.
    pub async fn send(&self, from: &str, recipients: &[String], body: &[u8]) -> Result<()> {
        let from = self.target.from_override.as_deref().unwrap_or(from);

        if self.target.host.is_empty() {
            debug!("relay target host is empty, discarding message");
            return Ok(());
        }

        info!(
            host = self.target.host,
            port = self.target.port,
            from,
            recipients = recipients.len(),
            "relaying message upstream"
        );

        match self.target.transport {
            Transport::Plain => self.send_over(self.connect_plain().await?, from, recipients, body).await,
            Transport::Tls => self.send_over(self.connect_tls().await?, from, recipients, body).await,
            Transport::StartTls => self.send_over(self.connect_starttls().await?, from, recipients, body).await,
        }
        .map_err(|e| GatewayError::Relay(e.to_string()))
    }

    async fn connect_plain(&self) -> Result<RelayStream> {
        let stream = TcpStream::connect((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|e| GatewayError::Relay(format!("connect to {}:{} failed: {e}", self.target.host, self.target.port)))?;
        Ok(RelayStream::Plain(stream))
    }

    async fn connect_tls(&self) -> Result<RelayStream> {
        let stream = TcpStream::connect((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|e| GatewayError::Relay(format!("connect to {}:{} failed: {e}", self.target.host, self.target.port)))?;
        let tls = self.upgrade(stream).await?;
        Ok(RelayStream::Tls(Box::new(tls)))
    }

    async fn connect_starttls(&self) -> Result<RelayStream> {
        let stream = TcpStream::connect((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|e| GatewayError::Relay(format!("connect to {}:{} failed: {e}", self.target.host, self.target.port)))?;

        let mut reader = BufReader::new(RelayStream::Plain(stream));
        read_greeting(&mut reader).await?;
        write_line(&mut reader, &format!("EHLO {}", local_hostname())).await?;
        read_multiline(&mut reader, "250").await?;
        write_line(&mut reader, "STARTTLS").await?;
        read_multiline(&mut reader, "220").await?;

        let RelayStream::Plain(tcp) = reader.into_inner() else {
            unreachable!("connect_starttls always builds a Plain stream before upgrading")
        };
        let tls = self.upgrade(tcp).await?;
        Ok(RelayStream::Tls(Box::new(tls)))
    }

    async fn upgrade(&self, tcp: TcpStream) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let connector = TlsConnector::from(TlsBundle::client_config(self.target.verify_tls));
        let server_name = rustls::ServerName::try_from(self.target.host.as_str())
            .map_err(|e| GatewayError::Relay(format!("invalid relay TLS server name: {e}")))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| GatewayError::Relay(format!("TLS handshake with relay failed: {e}")))
    }

    async fn send_over(
        &self,
        stream: RelayStream,
        from: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<()> {
        let mut stream = BufReader::new(stream);
        read_greeting(&mut stream).await?;

        write_line(&mut stream, &format!("EHLO {}", local_hostname())).await?;
        read_multiline(&mut stream, "250").await?;

        match self.target.auth_method {
            RelayAuthMethod::None => {}
            RelayAuthMethod::Plain => self.auth_plain(&mut stream).await?,
            RelayAuthMethod::CramMd5 => self.auth_cram_md5(&mut stream).await?,
        }

        write_line(&mut stream, &format!("MAIL FROM:<{from}>")).await?;
        read_multiline(&mut stream, "250").await?;

        for rcpt in recipients {
            write_line(&mut stream, &format!("RCPT TO:<{rcpt}>")).await?;
            read_multiline(&mut stream, "250").await?;
        }

        write_line(&mut stream, "DATA").await?;
        read_multiline(&mut stream, "354").await?;

        stream.write_all(&dot_stuff(body)).await?;
        stream.write_all(b".\r\n").await?;
        read_multiline(&mut stream, "250").await?;

        write_line(&mut stream, "QUIT").await?;
        let _ = read_line(&mut stream).await;

        Ok(())
    }

    async fn auth_plain(&self, stream: &mut BufReader<RelayStream>) -> Result<()> {
        write_line(stream, "AUTH PLAIN").await?;
        read_multiline(stream, "334").await?;

        let creds = format!("\0{}\0{}", self.target.username, self.target.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        write_line(stream, &encoded).await?;
        read_multiline(stream, "235").await?;
        Ok(())
    }

    async fn auth_cram_md5(&self, stream: &mut BufReader<RelayStream>) -> Result<()> {
        write_line(stream, "AUTH CRAM-MD5").await?;
        let challenge_line = read_multiline(stream, "334").await?;
        let challenge_b64 = challenge_line
            .splitn(2, ' ')
            .nth(1)
            .ok_or_else(|| GatewayError::Relay("malformed CRAM-MD5 challenge".to_string()))?
            .trim();
        let challenge = base64::engine::general_purpose::STANDARD
            .decode(challenge_b64)
            .map_err(|e| GatewayError::Relay(format!("malformed CRAM-MD5 challenge: {e}")))?;

        let mut mac = Hmac::<Md5>::new_from_slice(self.target.password.as_bytes())
            .map_err(|e| GatewayError::Relay(format!("CRAM-MD5 key setup failed: {e}")))?;
        mac.update(&challenge);
        let digest = hex::encode(mac.finalize().into_bytes());

        let response = format!("{} {}", self.target.username, digest);
        let encoded = base64::engine::general_purpose::STANDARD.encode(response);
        write_line(stream, &encoded).await?;
        read_multiline(stream, "235").await?;
        Ok(())
    }
}

/// Escape leading dots for the DATA wire format and ensure a trailing CRLF
/// before the caller appends the `.\r\n` terminator.
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

enum RelayStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            RelayStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            RelayStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            RelayStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            RelayStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn write_line(stream: &mut BufReader<RelayStream>, line: &str) -> Result<()> {
    debug!("relay > {}", line);
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    Ok(())
}

/// Read one CRLF-terminated line, trimmed of the line ending.
async fn read_line(stream: &mut BufReader<RelayStream>) -> Result<String> {
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Err(GatewayError::Relay("upstream closed connection".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read (and discard) the 220 greeting, requiring it to actually be a 220.
async fn read_greeting(stream: &mut BufReader<RelayStream>) -> Result<()> {
    let line = read_line(stream).await?;
    if !line.starts_with("220") {
        return Err(GatewayError::Relay(format!("unexpected greeting: {line}")));
    }
    Ok(())
}

/// Read a (possibly multi-line, `-`-continued) SMTP response and assert it
/// starts with `expected`. Returns the last line read (used to pull the
/// CRAM-MD5 challenge out of a `334` response).
async fn read_multiline(stream: &mut BufReader<RelayStream>, expected: &str) -> Result<String> {
    let mut last = String::new();
    loop {
        last = read_line(stream).await?;
        debug!("relay < {}", last);
        if last.len() < 4 || last.as_bytes()[3] != b'-' {
            break;
        }
    }
    if !last.starts_with(expected) {
        return Err(GatewayError::Relay(format!("expected {expected}, got: {last}")));
    }
    Ok(last)
}
