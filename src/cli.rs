//! Command-line entry points, grounded on `original_source/cmd/root.go` and
//! `cmd/password.go`: a bare `serve` action (the default when no
//! subcommand is given) plus a `password` subcommand for generating bcrypt
//! hashes to paste into `smtp.auth.users`.

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::health::HealthServer;
use crate::process::{Supervisor, Worker, WorkerFactory};
use crate::relay::{RelayClient, RelayTarget};
use crate::security::auth::{AuthStore, AuthUser};
use crate::security::tls::TlsBundle;
use crate::smtp::{Fleet, Server, SessionConfig};
use crate::timeout::Timeouts;
use crate::limit::Limits;
use crate::uri::Transport;
use crate::whitelist::Whitelist;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailbowl", about = "SMTP submission gateway: accept, authenticate, relay")]
pub struct Cli {
    /// Config file path (default: ./mailbowl.{yaml,toml,json,...} if present).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default action when no subcommand is given).
    Serve,
    /// Read a password from stdin and print its bcrypt hash.
    Password,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command.unwrap_or(Command::Serve) {
            Command::Serve => serve(self.config.as_deref()).await,
            Command::Password => password(),
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_new(config.log.level.as_str()).unwrap_or_else(|_| EnvFilter::new("warn"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(config.log.color);

    match config.log.format {
        crate::config::LogFormat::Json => subscriber.json().init(),
        crate::config::LogFormat::Logfmt | crate::config::LogFormat::Console => subscriber.init(),
    }
}

async fn serve(config_file: Option<&str>) -> Result<()> {
    // Logging is initialized once, from the first load, and left in place
    // across reloads — `tracing_subscriber`'s global dispatcher can't be
    // swapped, so a changed `log.*` setting only takes effect on restart.
    let config = Config::load(config_file)?;
    init_logging(&config);

    let config_file = config_file.map(str::to_string);
    let factory: WorkerFactory = Box::new(move || build_fleet(config_file.as_deref()));

    Supervisor::with_factory(factory).start().await
}

/// Rebuilds the full worker fleet from a fresh [`Config::load`]. Called
/// once up front and again on every reload cycle (spec.md §4.7, S7), so a
/// changed whitelist, TLS bundle, auth store, or listener set takes effect
/// without a process restart.
fn build_fleet(config_file: Option<&str>) -> Result<Vec<Arc<dyn Worker>>> {
    let config = Config::load(config_file)?;
    info!(config = %config.redacted_json().unwrap_or_default(), "loaded configuration");

    let tls_bundle = match TlsBundle::new(
        &config.smtp.tls.key,
        &config.smtp.tls.certificate,
        &config.smtp.tls.key_file,
        &config.smtp.tls.certificate_file,
        config.smtp.tls.force_for_starttls,
    ) {
        Ok(bundle) => Some(Arc::new(bundle)),
        Err(GatewayError::Tls(_)) => {
            warn!("TLS not configured; tls:// and starttls:// listeners will refuse to start");
            None
        }
        Err(e) => return Err(e),
    };

    let auth_users = config
        .smtp
        .auth
        .users
        .iter()
        .filter(|u| !u.email.is_empty() && !u.password_hash.is_empty())
        .map(|u| AuthUser {
            username: u.email.clone(),
            password_hash: u.password_hash.clone(),
        })
        .collect::<Vec<_>>();

    let auth_store = Arc::new(if config.smtp.auth.enabled {
        AuthStore::new(auth_users)
    } else {
        AuthStore::default()
    });

    let whitelist = Arc::new(Whitelist::new(&config.smtp.whitelist));

    let relay_target = RelayTarget {
        host: config.relay.outgoing_server.host.clone(),
        port: config.relay.outgoing_server.port,
        transport: relay_transport(&config.relay.outgoing_server.connection_type),
        auth_method: crate::relay::RelayAuthMethod::from_str(&config.relay.outgoing_server.auth_method),
        username: config.relay.outgoing_server.username.clone(),
        password: config.relay.outgoing_server.password.clone(),
        from_override: if config.relay.outgoing_server.from_email.is_empty() {
            None
        } else {
            Some(config.relay.outgoing_server.from_email.clone())
        },
        verify_tls: config.relay.outgoing_server.verify_tls,
    };
    let relay = Arc::new(RelayClient::new(relay_target));

    let limits = Limits::new(
        config.smtp.limit.connections,
        config.smtp.limit.message_size,
        config.smtp.limit.recipients,
    );
    let timeouts = Timeouts::new(config.smtp.timeout.read, config.smtp.timeout.write, config.smtp.timeout.data);

    // Each listener gets its own `SessionConfig`, differing only in
    // `transport` — AUTH gating and the STARTTLS command's availability
    // both key off the owning listener's scheme (DESIGN.md Open Question 2).
    let listener_uris = config.smtp.listener_uris()?;
    let servers = listener_uris
        .into_iter()
        .map(|uri| {
            let session_config = Arc::new(SessionConfig {
                hostname: config.smtp.hostname.clone(),
                transport: uri.transport,
                limits: limits.clone(),
                timeouts: timeouts.clone(),
                tls_bundle: tls_bundle.clone(),
                force_for_starttls: config.smtp.tls.force_for_starttls,
                auth_store: auth_store.clone(),
                relay: relay.clone(),
            });
            Server::new(uri, session_config, whitelist.clone())
        })
        .collect::<Result<Vec<_>>>()?;

    let fleet: Arc<dyn Worker> = Arc::new(Fleet::new(servers));
    let health: Arc<dyn Worker> = Arc::new(HealthServer::new(None));

    Ok(vec![fleet, health])
}

fn relay_transport(connection_type: &str) -> Transport {
    match connection_type.to_ascii_lowercase().as_str() {
        "plain" => Transport::Plain,
        "starttls" => Transport::StartTls,
        _ => Transport::Tls,
    }
}

fn password() -> Result<()> {
    let password = rpassword::prompt_password("Enter password (it will be hidden): ")
        .map_err(|e| GatewayError::Config(format!("failed to read password: {e}")))?;

    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| GatewayError::Config(format!("failed to hash password: {e}")))?;

    println!("{hash}");
    Ok(())
}
