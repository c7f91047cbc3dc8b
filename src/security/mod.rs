//! Security building blocks shared across listeners:
//! - [`auth`]: the static bcrypt-backed SMTP AUTH user store
//! - [`tls`]: TLS bundle construction and STARTTLS acceptor

pub mod auth;
pub mod tls;

pub use auth::{AuthMechanism, AuthStore, AuthUser};
pub use tls::TlsBundle;
