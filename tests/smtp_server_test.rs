//! End-to-end dialogs against a real [`mailbowl_rs::smtp::Server`] accept
//! loop: whitelist enforcement, the connection cap, and a full plain
//! MAIL/RCPT/DATA transaction (spec.md §8 scenarios S1, S3).

use mailbowl_rs::limit::Limits;
use mailbowl_rs::relay::{RelayClient, RelayTarget};
use mailbowl_rs::security::{AuthStore, TlsBundle};
use mailbowl_rs::smtp::{Server, SessionConfig};
use mailbowl_rs::timeout::Timeouts;
use mailbowl_rs::uri::ListenerUri;
use mailbowl_rs::whitelist::Whitelist;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn start_server(whitelist_cidrs: &[String], limits: Limits) -> (ListenerUri, CancellationToken) {
    // Probe an OS-assigned free port, then hand that exact address to
    // `Server::new`/`serve`, which does its own bind; the probe socket is
    // dropped first so the port is free again by the time `serve` binds it.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let uri: ListenerUri = format!("plain://127.0.0.1:{port}").parse().unwrap();

    let config = Arc::new(SessionConfig {
        hostname: "mx.test.local".to_string(),
        transport: uri.transport,
        limits,
        timeouts: Timeouts::default(),
        tls_bundle: None::<Arc<TlsBundle>>,
        force_for_starttls: true,
        auth_store: Arc::new(AuthStore::default()),
        relay: Arc::new(RelayClient::new(RelayTarget::discard())),
    });

    let whitelist = Arc::new(Whitelist::new(whitelist_cidrs));
    let server = Server::new(uri.clone(), config, whitelist).unwrap();
    let cancel = CancellationToken::new();
    let running = cancel.clone();

    tokio::spawn(async move {
        let _ = server.serve(running).await;
    });

    // Give the accept loop a moment to bind before the test connects.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    (uri, cancel)
}

async fn connect(uri: &ListenerUri) -> TcpStream {
    TcpStream::connect(uri.address()).await.unwrap()
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::ReadHalf<'_>>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

async fn write_line(writer: &mut tokio::net::tcp::WriteHalf<'_>, line: &str) {
    writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
}

#[tokio::test]
async fn plain_accept_no_auth_completes_a_full_transaction() {
    let (uri, _cancel) = start_server(&["127.0.0.1/32".to_string()], Limits::default()).await;
    let stream = connect(&uri).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    assert!(read_line(&mut reader).await.starts_with("220"));

    write_line(&mut write_half, "HELO client.test").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_line(&mut write_half, "MAIL FROM:<a@example.com>").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_line(&mut write_half, "RCPT TO:<b@example.com>").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_line(&mut write_half, "DATA").await;
    assert!(read_line(&mut reader).await.starts_with("354"));

    write_line(&mut write_half, "Subject: hi").await;
    write_line(&mut write_half, "").await;
    write_line(&mut write_half, "body").await;
    write_line(&mut write_half, ".").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_line(&mut write_half, "QUIT").await;
    assert!(read_line(&mut reader).await.starts_with("221"));
}

#[tokio::test]
async fn peer_outside_whitelist_is_denied() {
    let (uri, _cancel) = start_server(&["10.0.0.0/8".to_string()], Limits::default()).await;
    let stream = connect(&uri).await;
    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let line = read_line(&mut reader).await;
    assert!(line.starts_with("421"), "expected 421 Denied, got: {line}");
}

#[tokio::test]
async fn connection_cap_rejects_beyond_the_limit() {
    let limits = Limits::new(1, 1024, 100);
    let (uri, _cancel) = start_server(&["127.0.0.1/32".to_string()], limits).await;

    // Hold the first connection open past its greeting so it still counts
    // against the cap when the second connection arrives.
    let first = connect(&uri).await;
    let (first_read, _first_write) = first.into_split();
    let mut first_reader = BufReader::new(first_read);
    assert!(read_line(&mut first_reader).await.starts_with("220"));

    let second = connect(&uri).await;
    let (second_read, _second_write) = second.into_split();
    let mut second_reader = BufReader::new(second_read);
    let line = read_line(&mut second_reader).await;
    assert!(line.starts_with("421"), "expected 421 Too many connections, got: {line}");
}
