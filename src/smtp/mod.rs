//! SMTP submission gateway: command parsing, per-connection state machine,
//! per-listener accept loop, and the fleet of listeners run as one
//! [`crate::process::Worker`].

pub mod commands;
pub mod fleet;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use fleet::Fleet;
pub use server::Server;
pub use session::{SessionConfig, SmtpSession};
