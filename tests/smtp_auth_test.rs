//! End-to-end SMTP AUTH dialogs against a real [`Server`]: successful and
//! rejected `AUTH PLAIN`, and the gate that refuses MAIL FROM before AUTH
//! when auth is enabled (spec.md §4.4).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailbowl_rs::limit::Limits;
use mailbowl_rs::relay::{RelayClient, RelayTarget};
use mailbowl_rs::security::{AuthStore, AuthUser, TlsBundle};
use mailbowl_rs::smtp::{Server, SessionConfig};
use mailbowl_rs::timeout::Timeouts;
use mailbowl_rs::uri::ListenerUri;
use mailbowl_rs::whitelist::Whitelist;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const TEST_USER: &str = "user@example.com";
const TEST_PASSWORD: &str = "hunter2";

async fn start_authenticated_server() -> ListenerUri {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let uri: ListenerUri = format!("plain://127.0.0.1:{port}").parse().unwrap();

    let auth_store = AuthStore::new(vec![AuthUser {
        username: TEST_USER.to_string(),
        password_hash: bcrypt::hash(TEST_PASSWORD, bcrypt::DEFAULT_COST).unwrap(),
    }]);

    let config = Arc::new(SessionConfig {
        hostname: "mx.test.local".to_string(),
        transport: uri.transport,
        limits: Limits::default(),
        timeouts: Timeouts::default(),
        tls_bundle: None::<Arc<TlsBundle>>,
        force_for_starttls: true,
        auth_store: Arc::new(auth_store),
        relay: Arc::new(RelayClient::new(RelayTarget::discard())),
    });

    let whitelist = Arc::new(Whitelist::new(&["127.0.0.1/32".to_string()]));
    let server = Server::new(uri.clone(), config, whitelist).unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        let _ = server.serve(cancel).await;
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    uri
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
async fn mail_from_is_refused_before_auth() {
    let uri = start_authenticated_server().await;
    let stream = TcpStream::connect(uri.address()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    assert!(read_line(&mut reader).await.starts_with("220"));
    write_line(&mut write_half, "HELO client.test").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    write_line(&mut write_half, "MAIL FROM:<a@example.com>").await;
    let line = read_line(&mut reader).await;
    assert!(line.starts_with("530"), "expected 530 Authentication Required, got: {line}");
}

#[tokio::test]
async fn auth_plain_with_correct_credentials_unlocks_mail_from() {
    let uri = start_authenticated_server().await;
    let stream = TcpStream::connect(uri.address()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    assert!(read_line(&mut reader).await.starts_with("220"));
    write_line(&mut write_half, "HELO client.test").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    let creds = BASE64.encode(format!("\0{TEST_USER}\0{TEST_PASSWORD}"));
    write_line(&mut write_half, &format!("AUTH PLAIN {creds}")).await;
    let line = read_line(&mut reader).await;
    assert!(line.starts_with("235"), "expected 235 Authentication successful, got: {line}");

    write_line(&mut write_half, "MAIL FROM:<a@example.com>").await;
    assert!(read_line(&mut reader).await.starts_with("250"));
}

#[tokio::test]
async fn auth_plain_with_wrong_password_is_rejected() {
    let uri = start_authenticated_server().await;
    let stream = TcpStream::connect(uri.address()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    assert!(read_line(&mut reader).await.starts_with("220"));
    write_line(&mut write_half, "HELO client.test").await;
    assert!(read_line(&mut reader).await.starts_with("250"));

    let creds = BASE64.encode(format!("\0{TEST_USER}\0wrong-password"));
    write_line(&mut write_half, &format!("AUTH PLAIN {creds}")).await;
    let line = read_line(&mut reader).await;
    assert!(line.starts_with("535"), "expected 535 Authentication credentials invalid, got: {line}");
}

#[tokio::test]
async fn ehlo_advertises_auth_mechanisms_when_enabled() {
    let uri = start_authenticated_server().await;
    let stream = TcpStream::connect(uri.address()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    assert!(read_line(&mut reader).await.starts_with("220"));
    write_line(&mut write_half, "EHLO client.test").await;

    let mut saw_auth = false;
    loop {
        let line = read_line(&mut reader).await;
        if line.contains("AUTH PLAIN LOGIN") {
            saw_auth = true;
        }
        if line.starts_with("250 ") {
            break;
        }
    }
    assert!(saw_auth, "EHLO response should advertise AUTH PLAIN LOGIN");
}
