//! SMTP AUTH: a static, config-provided user store with bcrypt-hashed
//! passwords (spec.md §4.4). There is no database — the whole set of
//! credentials is loaded once at startup and swapped in on reload like
//! every other part of a config snapshot.

use crate::error::{GatewayError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, warn};

/// A bcrypt hash of an unguessable, never-issued password. Used to pay the
/// cost of a bcrypt comparison even when the username doesn't match any
/// configured user, so a timing attack can't distinguish "no such user"
/// from "wrong password".
const DUMMY_HASH: &str = "$2b$12$C6UzMDM.H6dfI/f/IKcEeO2ZJjVHsCZ/qjwcO4rHq5HiQmMqDJNUu";

/// SMTP AUTH mechanisms understood by the listener side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// One configured SMTP AUTH identity.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub password_hash: String,
}

/// Static in-memory credential store built from `smtp.auth.users` at
/// startup/reload. `enabled() == false` means no `AUTH PLAIN`/`AUTH LOGIN`
/// line is advertised and the command is rejected with `503`.
#[derive(Clone, Default)]
pub struct AuthStore {
    users: Vec<AuthUser>,
}

impl AuthStore {
    pub fn new(users: Vec<AuthUser>) -> Self {
        AuthStore { users }
    }

    pub fn enabled(&self) -> bool {
        !self.users.is_empty()
    }

    /// Verify `username`/`password` against the configured users.
    ///
    /// Always performs exactly one bcrypt comparison, whether or not
    /// `username` is known, so failure latency doesn't leak which
    /// usernames are registered.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let matched = self.users.iter().find(|u| u.username == username);
        let hash = matched.map(|u| u.password_hash.as_str()).unwrap_or(DUMMY_HASH);

        let verified = bcrypt::verify(password, hash).unwrap_or(false);
        let ok = matched.is_some() && verified;

        if ok {
            debug!(username, "AUTH succeeded");
        } else {
            warn!(username, "AUTH failed");
        }
        ok
    }

    /// Decode `AUTH PLAIN` payload: base64(`\0authzid\0authcid\0passwd`
    /// collapses to `\0username\0password`).
    pub fn decode_plain(auth_data: &str) -> Result<(String, String)> {
        let decoded = BASE64
            .decode(auth_data.trim())
            .map_err(|e| GatewayError::Session(format!("invalid base64: {e}")))?;

        let parts: Vec<&str> = std::str::from_utf8(&decoded)
            .map_err(|e| GatewayError::Session(format!("invalid utf-8 in AUTH PLAIN: {e}")))?
            .split('\0')
            .collect();

        if parts.len() != 3 {
            return Err(GatewayError::Session("malformed AUTH PLAIN payload".to_string()));
        }

        Ok((parts[1].to_string(), parts[2].to_string()))
    }

    /// Decode one base64 line of `AUTH LOGIN` (username, then password).
    pub fn decode_login(credential: &str) -> Result<String> {
        let decoded = BASE64
            .decode(credential.trim())
            .map_err(|e| GatewayError::Session(format!("invalid base64: {e}")))?;

        String::from_utf8(decoded).map_err(|e| GatewayError::Session(format!("invalid utf-8 in AUTH LOGIN: {e}")))
    }
}
