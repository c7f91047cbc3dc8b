use thiserror::Error;

/// Crate-wide error taxonomy (spec.md §7).
///
/// `Policy` and `Relay` carry the SMTP reply code the session layer should
/// send to the peer, so turning an error into a wire response is a single
/// match arm instead of re-deriving the code from the error variant.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener {uri}: {source}")]
    Bind {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SMTP session error: {0}")]
    Session(String),

    #[error("policy rejection ({code}): {message}")]
    Policy { code: u16, message: String },

    #[error("relay error: {0}")]
    Relay(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn policy(code: u16, message: impl Into<String>) -> Self {
        GatewayError::Policy {
            code,
            message: message.into(),
        }
    }

    /// SMTP reply code this error should be surfaced to the peer as.
    ///
    /// Session-level and IO errors have no single associated code; callers
    /// handling those close the connection instead of replying.
    pub fn smtp_code(&self) -> Option<u16> {
        match self {
            GatewayError::Policy { code, .. } => Some(*code),
            GatewayError::Relay(_) => Some(554),
            _ => None,
        }
    }
}
