//! Per-connection SMTP state machine (spec.md §4.5).

use crate::error::{GatewayError, Result};
use crate::limit::Limits;
use crate::relay::RelayClient;
use crate::security::{AuthMechanism, AuthStore, TlsBundle};
use crate::smtp::commands::SmtpCommand;
use crate::timeout::Timeouts;
use crate::uri::Transport;
use crate::utils::validate_email;
use chrono::Utc;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

/// Maximum length of a command line (not the DATA body, which is bounded by
/// `Limits::max_message_bytes`). Guards against unbounded buffering of a
/// single pre-DATA line.
const MAX_COMMAND_LINE_LENGTH: usize = 4096;

/// Extra bytes of slack allowed past `max_message_bytes` before DATA
/// enforcement aborts, per spec.md §9's "DATA size enforcement" note.
const DATA_OVERHEAD: usize = 4096;

/// Consecutive protocol errors before the session is forcibly closed.
const MAX_ERRORS: usize = 10;

/// Stream type shared by plain and TLS connections, letting STARTTLS swap
/// the underlying transport mid-session without the caller losing
/// ownership of the session.
pub enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient placeholder while `mem::replace` performs a STARTTLS swap;
    /// never observed by I/O code.
    Upgrading,
}

impl SmtpStream {
    fn is_tls(&self) -> bool {
        matches!(self, SmtpStream::Tls(_))
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeted,
    HeloSeen,
    MailFrom,
    RcptTo,
}

/// Dependencies shared by every session accepted on one listener. Built
/// once per server (and rebuilt whole on reload), never mutated in place.
pub struct SessionConfig {
    pub hostname: String,
    pub transport: Transport,
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub tls_bundle: Option<Arc<TlsBundle>>,
    pub force_for_starttls: bool,
    pub auth_store: Arc<AuthStore>,
    pub relay: Arc<RelayClient>,
}

enum Loop {
    Continue,
    Quit,
}

pub struct SmtpSession {
    config: Arc<SessionConfig>,
    peer_addr: SocketAddr,
    connected_at: chrono::DateTime<Utc>,
    state: State,
    helo_domain: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    authenticated_user: Option<String>,
    error_count: usize,
}

impl SmtpSession {
    pub fn new(config: Arc<SessionConfig>, peer_addr: SocketAddr) -> Self {
        SmtpSession {
            config,
            peer_addr,
            connected_at: Utc::now(),
            state: State::Greeted,
            helo_domain: None,
            from: None,
            to: Vec::new(),
            authenticated_user: None,
            error_count: 0,
        }
    }

    /// Run the session to completion. Returns once the peer disconnects, a
    /// fatal I/O error occurs, or QUIT is issued.
    pub async fn handle(mut self, stream: SmtpStream) -> Result<()> {
        let mut stream = stream;

        stream
            .write_all(format!("220 {} ESMTP Service Ready\r\n", self.config.hostname).as_bytes())
            .await?;
        stream.flush().await?;

        loop {
            match self.process_commands(&mut stream).await? {
                Loop::Continue => continue,
                Loop::Quit => break,
            }
        }

        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<Loop> {
        // `is_tls` is fixed for the lifetime of this call: the only thing
        // that can change it is STARTTLS, which drops `reader` and returns
        // immediately so `process_commands` is re-entered with a fresh
        // stream. Stashing it up front avoids re-borrowing `stream` while
        // `reader` holds it mutably.
        let is_tls = stream.is_tls();
        let mut reader = BufReader::new(&mut *stream);
        let mut line = String::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!(peer = %self.peer_addr, "too many protocol errors, closing");
                reader.write_all(b"421 Too many errors, closing connection\r\n").await?;
                return Ok(Loop::Quit);
            }

            line.clear();
            let read = match timeout(self.config.timeouts.read, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    reader.write_all(b"421 Timeout, closing connection\r\n").await?;
                    return Ok(Loop::Quit);
                }
            };

            if read == 0 {
                return Ok(Loop::Quit);
            }

            if line.len() > MAX_COMMAND_LINE_LENGTH {
                reader.write_all(b"500 Line too long\r\n").await?;
                self.error_count += 1;
                continue;
            }

            let cmd = match SmtpCommand::parse(&line) {
                Ok(cmd) => cmd,
                Err(_) => {
                    reader.write_all(b"500 Syntax error, command unrecognized\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
            };

            if matches!(cmd, SmtpCommand::Starttls) {
                drop(reader);
                return match self.handle_starttls(stream).await? {
                    true => Ok(Loop::Continue),
                    false => Ok(Loop::Continue),
                };
            }

            if let SmtpCommand::Auth(mechanism, initial_response) = cmd.clone() {
                if let Err(e) = self.handle_auth(&mechanism, initial_response, &mut reader, is_tls).await {
                    warn!(peer = %self.peer_addr, error = %e, "AUTH failed");
                    reader.write_all(b"535 Authentication credentials invalid\r\n").await?;
                    self.error_count += 1;
                }
                continue;
            }

            if matches!(cmd, SmtpCommand::Data) {
                match self.begin_data(is_tls) {
                    Ok(()) => {
                        reader.write_all(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n").await?;
                        self.receive_data(&mut reader, is_tls).await?;
                    }
                    Err(e) => self.reply_error(&mut reader, e).await?,
                }
                continue;
            }

            match self.handle_command(cmd, is_tls).await {
                Ok(response) => {
                    let quitting = response.starts_with("221");
                    reader.write_all(response.as_bytes()).await?;
                    if quitting {
                        return Ok(Loop::Quit);
                    }
                }
                Err(e) => self.reply_error(&mut reader, e).await?,
            }
        }
    }

    async fn reply_error<S>(&mut self, stream: &mut BufReader<S>, err: GatewayError) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (code, message) = match &err {
            GatewayError::Policy { code, message } => (*code, message.clone()),
            other => (451, other.to_string()),
        };
        stream.write_all(format!("{code} {message}\r\n").as_bytes()).await?;
        self.error_count += 1;
        Ok(())
    }

    fn auth_allowed_in_clear(&self) -> bool {
        self.config.transport == Transport::Plain
    }

    fn requires_tls_before_envelope(&self, is_tls: bool) -> bool {
        self.config.transport == Transport::StartTls && self.config.force_for_starttls && !is_tls
    }

    async fn handle_command(&mut self, cmd: SmtpCommand, is_tls: bool) -> Result<String> {
        match (self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!(peer = %self.peer_addr, domain, "HELO");
                self.helo_domain = Some(domain.clone());
                self.state = State::HeloSeen;
                Ok(format!("250 {} Hello {}\r\n", self.config.hostname, domain))
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!(peer = %self.peer_addr, domain, "EHLO");
                self.helo_domain = Some(domain.clone());
                self.state = State::HeloSeen;
                Ok(self.ehlo_response(&domain, is_tls))
            }
            (State::HeloSeen | State::MailFrom | State::RcptTo, SmtpCommand::MailFrom { address, size }) => {
                if self.requires_tls_before_envelope(is_tls) {
                    return Err(GatewayError::policy(530, "Authentication Required."));
                }
                if self.config.auth_store.enabled() && self.authenticated_user.is_none() {
                    return Err(GatewayError::policy(530, "Authentication Required."));
                }
                if let Some(size) = size {
                    if size > self.config.limits.max_message_bytes as u64 {
                        return Err(GatewayError::policy(552, "message size exceeds fixed maximum message size"));
                    }
                }
                validate_email(&address)?;

                info!(peer = %self.peer_addr, from = address, "MAIL FROM");
                self.from = Some(address);
                self.to.clear();
                self.state = State::MailFrom;
                Ok("250 OK\r\n".to_string())
            }
            (State::MailFrom | State::RcptTo, SmtpCommand::RcptTo(to)) => {
                validate_email(&to)?;

                if self.to.len() >= self.config.limits.max_recipients {
                    return Err(GatewayError::policy(
                        452,
                        format!("too many recipients (max {})", self.config.limits.max_recipients),
                    ));
                }

                info!(peer = %self.peer_addr, to, "RCPT TO");
                self.to.push(to);
                self.state = State::RcptTo;
                Ok("250 OK\r\n".to_string())
            }
            (_, SmtpCommand::Rset) => {
                self.reset_envelope();
                Ok("250 OK\r\n".to_string())
            }
            (_, SmtpCommand::Noop) => Ok("250 OK\r\n".to_string()),
            (_, SmtpCommand::Quit) => {
                info!(peer = %self.peer_addr, "QUIT");
                Ok(format!("221 {} closing connection\r\n", self.config.hostname))
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                warn!(peer = %self.peer_addr, cmd, "unrecognized command");
                Ok("500 Syntax error, command unrecognized\r\n".to_string())
            }
            (_, SmtpCommand::Data) | (_, SmtpCommand::MailFrom { .. }) | (_, SmtpCommand::RcptTo(_)) => {
                Ok("503 Bad sequence of commands\r\n".to_string())
            }
            (_, SmtpCommand::Starttls) | (_, SmtpCommand::Auth(_, _)) => {
                unreachable!("STARTTLS/AUTH are intercepted before reaching handle_command")
            }
        }
    }

    fn ehlo_response(&self, domain: &str, is_tls: bool) -> String {
        let mut response = format!("250-{} Hello {}\r\n", self.config.hostname, domain);
        response.push_str(&format!("250-SIZE {}\r\n", self.config.limits.max_message_bytes));

        if self.config.transport == Transport::StartTls && !is_tls {
            response.push_str("250-STARTTLS\r\n");
        }

        if self.config.auth_store.enabled() && (self.auth_allowed_in_clear() || is_tls) {
            response.push_str("250-AUTH PLAIN LOGIN\r\n");
        }

        response.push_str("250-8BITMIME\r\n");
        response.push_str("250 PIPELINING\r\n");
        response
    }

    fn reset_envelope(&mut self) {
        self.from = None;
        self.to.clear();
        self.state = State::HeloSeen;
    }

    fn begin_data(&self, is_tls: bool) -> Result<()> {
        if self.requires_tls_before_envelope(is_tls) {
            return Err(GatewayError::policy(530, "Authentication Required."));
        }
        if self.state != State::RcptTo || self.to.is_empty() {
            return Err(GatewayError::policy(503, "Bad sequence of commands"));
        }
        Ok(())
    }

    /// Read the DATA body, unstuffing leading dots, until `\r\n.\r\n`.
    /// Enforces `max_message_bytes + DATA_OVERHEAD` **during** the read so a
    /// peer that never sends the terminator can't exhaust memory.
    async fn receive_data<S>(&mut self, reader: &mut BufReader<S>, is_tls: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cap = self.config.limits.max_message_bytes + DATA_OVERHEAD;
        let mut data = Vec::new();
        let mut line = String::new();
        let mut overflowed = false;

        loop {
            line.clear();
            let read = match timeout(self.config.timeouts.data, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    reader.write_all(b"451 Timeout receiving message\r\n").await?;
                    self.reset_envelope();
                    return Ok(());
                }
            };

            if read == 0 {
                return Err(GatewayError::Session("connection closed during DATA".to_string()));
            }

            if line.trim_end_matches(['\r', '\n']) == "." {
                break;
            }

            if overflowed {
                continue;
            }

            if data.len() + line.len() > cap {
                overflowed = true;
                continue;
            }

            if let Some(rest) = line.strip_prefix('.') {
                data.extend_from_slice(rest.as_bytes());
            } else {
                data.extend_from_slice(line.as_bytes());
            }
        }

        if overflowed {
            warn!(peer = %self.peer_addr, "message exceeded max_message_bytes during DATA");
            reader
                .write_all(b"552 Message size exceeds fixed maximum message size\r\n")
                .await?;
            self.reset_envelope();
            return Ok(());
        }

        let data = self.prepend_received_header(data, is_tls);

        let from = self.from.clone().unwrap_or_default();
        let to = self.to.clone();

        match self.config.relay.send(&from, &to, &data).await {
            Ok(()) => {
                info!(peer = %self.peer_addr, from, recipients = to.len(), bytes = data.len(), "message relayed");
                reader.write_all(b"250 OK: message accepted\r\n").await?;
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, from, error = %e, "relay forwarding failed");
                reader.write_all(b"554 Transaction failed: forwarding failed\r\n").await?;
            }
        }

        self.reset_envelope();
        Ok(())
    }

    fn prepend_received_header(&self, body: Vec<u8>, is_tls: bool) -> Vec<u8> {
        let helo = self.helo_domain.as_deref().unwrap_or("unknown");
        let mut with = String::from("ESMTP");
        if is_tls {
            with.push('S');
        }
        if self.authenticated_user.is_some() {
            with.push('A');
        }
        let header = format!(
            "Received: from {} ({})\r\n\tby {} with {}; {}\r\n",
            helo,
            self.peer_addr.ip(),
            self.config.hostname,
            with,
            self.connected_at.to_rfc2822(),
        );

        let mut out = Vec::with_capacity(header.len() + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Perform the RFC 3207 mid-session TLS upgrade. Returns `Ok(true)` if
    /// the stream was upgraded (caller must restart command processing with
    /// a fresh reader); `Ok(false)` if STARTTLS was refused and the
    /// existing reader can keep being used.
    async fn handle_starttls(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        if self.config.transport != Transport::StartTls {
            stream.write_all(b"502 STARTTLS not available\r\n").await?;
            return Ok(false);
        }
        if stream.is_tls() {
            stream.write_all(b"503 Already using TLS\r\n").await?;
            return Ok(false);
        }
        if self.state != State::HeloSeen {
            stream.write_all(b"503 Bad sequence of commands\r\n").await?;
            return Ok(false);
        }
        let Some(bundle) = self.config.tls_bundle.clone() else {
            stream.write_all(b"502 STARTTLS not available\r\n").await?;
            return Ok(false);
        };

        stream.write_all(b"220 Ready to start TLS\r\n").await?;
        stream.flush().await?;

        let tcp = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(GatewayError::Session("STARTTLS attempted on a non-plain stream".to_string()));
            }
        };

        let tls_stream = match bundle.acceptor().accept(tcp).await {
            Ok(tls) => tls,
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "TLS handshake failed during STARTTLS");
                return Err(GatewayError::Tls(format!("handshake failed: {e}")));
            }
        };

        *stream = SmtpStream::Tls(Box::new(tls_stream));
        self.reset_envelope();
        info!(peer = %self.peer_addr, "STARTTLS upgrade complete");
        Ok(true)
    }

    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        stream: &mut BufReader<S>,
        is_tls: bool,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.config.auth_store.enabled() {
            stream.write_all(b"502 AUTH not available\r\n").await?;
            return Ok(());
        }
        if self.authenticated_user.is_some() {
            stream.write_all(b"503 Already authenticated\r\n").await?;
            return Ok(());
        }
        if !(self.auth_allowed_in_clear() || is_tls) {
            stream.write_all(b"530 Must issue STARTTLS first\r\n").await?;
            return Ok(());
        }

        let auth_mechanism = match AuthMechanism::from_str(mechanism) {
            Some(m) => m,
            None => {
                stream.write_all(b"504 Authentication mechanism not supported\r\n").await?;
                return Ok(());
            }
        };

        debug!(peer = %self.peer_addr, mechanism = auth_mechanism.as_str(), "AUTH started");

        let (username, password) = match auth_mechanism {
            AuthMechanism::Plain => {
                let payload = match initial_response {
                    Some(data) => data,
                    None => {
                        stream.write_all(b"334 \r\n").await?;
                        Self::read_auth_line(stream, self.config.timeouts.read).await?
                    }
                };
                AuthStore::decode_plain(&payload)?
            }
            AuthMechanism::Login => {
                stream.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                let username_line = Self::read_auth_line(stream, self.config.timeouts.read).await?;
                let username = AuthStore::decode_login(&username_line)?;

                stream.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                let password_line = Self::read_auth_line(stream, self.config.timeouts.read).await?;
                let password = AuthStore::decode_login(&password_line)?;
                (username, password)
            }
        };

        let store = self.config.auth_store.clone();
        let (check_user, check_pass) = (username.clone(), password.clone());
        let ok = tokio::task::spawn_blocking(move || store.authenticate(&check_user, &check_pass))
            .await
            .map_err(|e| GatewayError::Session(format!("auth task panicked: {e}")))?;

        if ok {
            self.authenticated_user = Some(username);
            stream.write_all(b"235 Authentication successful\r\n").await?;
        } else {
            return Err(GatewayError::Session("invalid credentials".to_string()));
        }

        Ok(())
    }

    async fn read_auth_line<S>(stream: &mut BufReader<S>, read_timeout: std::time::Duration) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();
        let n = timeout(read_timeout, stream.read_line(&mut line))
            .await
            .map_err(|_| GatewayError::Session("AUTH timed out".to_string()))??;
        if n == 0 {
            return Err(GatewayError::Session("connection closed during AUTH".to_string()));
        }
        Ok(line.trim().to_string())
    }
}

/// Per-listener accepted-connection counter, incremented on accept and
/// decremented when the session's guard drops.
#[derive(Default)]
pub struct ConnectionCounter(AtomicUsize);

impl ConnectionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionCounter(AtomicUsize::new(0)))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(self.clone())
    }
}

pub struct ConnectionGuard(Arc<ConnectionCounter>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayClient, RelayTarget};

    fn test_config(transport: Transport, force_for_starttls: bool, auth_enabled: bool) -> Arc<SessionConfig> {
        use crate::security::AuthUser;

        let auth_store = if auth_enabled {
            AuthStore::new(vec![AuthUser {
                username: "test@example.local".to_string(),
                password_hash: bcrypt::hash("test", bcrypt::DEFAULT_COST).unwrap(),
            }])
        } else {
            AuthStore::default()
        };

        Arc::new(SessionConfig {
            hostname: "mx.example.test".to_string(),
            transport,
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            tls_bundle: None,
            force_for_starttls,
            auth_store: Arc::new(auth_store),
            relay: Arc::new(RelayClient::new(RelayTarget::discard())),
        })
    }

    fn session(config: Arc<SessionConfig>) -> SmtpSession {
        SmtpSession::new(config, "127.0.0.1:1025".parse().unwrap())
    }

    #[tokio::test]
    async fn helo_then_mail_without_auth_succeeds() {
        let mut s = session(test_config(Transport::Plain, false, false));
        let r = s.handle_command(SmtpCommand::Helo("x".to_string()), false).await.unwrap();
        assert!(r.starts_with("250"));
        let r = s
            .handle_command(
                SmtpCommand::MailFrom {
                    address: "a@b.com".to_string(),
                    size: None,
                },
                false,
            )
            .await
            .unwrap();
        assert!(r.starts_with("250"));
    }

    #[tokio::test]
    async fn mail_from_requires_auth_when_enabled() {
        let mut s = session(test_config(Transport::Plain, false, true));
        s.handle_command(SmtpCommand::Helo("x".to_string()), false).await.unwrap();
        let err = s
            .handle_command(
                SmtpCommand::MailFrom {
                    address: "a@b.com".to_string(),
                    size: None,
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Policy { code: 530, .. }));
    }

    #[tokio::test]
    async fn mail_from_rejects_oversized_declared_size() {
        let mut s = session(test_config(Transport::Plain, false, false));
        s.handle_command(SmtpCommand::Helo("x".to_string()), false).await.unwrap();
        let err = s
            .handle_command(
                SmtpCommand::MailFrom {
                    address: "a@b.com".to_string(),
                    size: Some(crate::limit::DEFAULT_MAX_MESSAGE_BYTES as u64 + 1),
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Policy { code: 552, .. }));
    }

    #[tokio::test]
    async fn rcpt_cap_rejects_the_nth_plus_one_recipient() {
        let mut config = test_config(Transport::Plain, false, false);
        Arc::get_mut(&mut config).unwrap().limits = Limits::new(100, 1024, 1);
        let mut s = session(config);
        s.handle_command(SmtpCommand::Helo("x".to_string()), false).await.unwrap();
        s.handle_command(
            SmtpCommand::MailFrom {
                address: "a@b.com".to_string(),
                size: None,
            },
            false,
        )
        .await
        .unwrap();
        let ok = s.handle_command(SmtpCommand::RcptTo("c@d.com".to_string()), false).await.unwrap();
        assert!(ok.starts_with("250"));
        let err = s.handle_command(SmtpCommand::RcptTo("e@f.com".to_string()), false).await.unwrap_err();
        assert!(matches!(err, GatewayError::Policy { code: 452, .. }));
    }

    #[tokio::test]
    async fn ehlo_advertises_starttls_only_for_starttls_scheme_unencrypted() {
        let s = session(test_config(Transport::StartTls, false, false));
        let r = s.ehlo_response("x", false);
        assert!(r.contains("STARTTLS"));
        let r = s.ehlo_response("x", true);
        assert!(!r.contains("STARTTLS"));
    }

    #[tokio::test]
    async fn ehlo_hides_auth_over_unencrypted_starttls_listener() {
        let s = session(test_config(Transport::StartTls, false, true));
        assert!(!s.ehlo_response("x", false).contains("AUTH"));
        assert!(s.ehlo_response("x", true).contains("AUTH"));
    }

    #[tokio::test]
    async fn ehlo_allows_auth_in_clear_on_plain_listener() {
        let s = session(test_config(Transport::Plain, false, true));
        assert!(s.ehlo_response("x", false).contains("AUTH"));
    }

    #[tokio::test]
    async fn force_for_starttls_blocks_mail_before_tls() {
        let mut s = session(test_config(Transport::StartTls, true, false));
        s.handle_command(SmtpCommand::Helo("x".to_string()), false).await.unwrap();
        let err = s
            .handle_command(
                SmtpCommand::MailFrom {
                    address: "a@b.com".to_string(),
                    size: None,
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Policy { code: 530, .. }));
    }

    #[tokio::test]
    async fn rset_clears_envelope_from_any_state() {
        let mut s = session(test_config(Transport::Plain, false, false));
        s.handle_command(SmtpCommand::Helo("x".to_string()), false).await.unwrap();
        s.handle_command(
            SmtpCommand::MailFrom {
                address: "a@b.com".to_string(),
                size: None,
            },
            false,
        )
        .await
        .unwrap();
        s.handle_command(SmtpCommand::Rset, false).await.unwrap();
        assert_eq!(s.state, State::HeloSeen);
        assert!(s.from.is_none());
    }

    #[tokio::test]
    async fn quit_yields_221() {
        let mut s = session(test_config(Transport::Plain, false, false));
        let r = s.handle_command(SmtpCommand::Quit, false).await.unwrap();
        assert!(r.starts_with("221"));
    }
}
