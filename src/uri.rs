//! Listener URI parsing: `plain://host:port`, `tls://host:port`,
//! `starttls://host:port`.

use crate::error::GatewayError;
use std::fmt;
use std::str::FromStr;

/// Transport a listener accepts connections over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Plain,
    Tls,
    StartTls,
}

impl Transport {
    fn as_scheme(&self) -> &'static str {
        match self {
            Transport::Plain => "plain",
            Transport::Tls => "tls",
            Transport::StartTls => "starttls",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "plain" => Some(Transport::Plain),
            "tls" => Some(Transport::Tls),
            "starttls" => Some(Transport::StartTls),
            _ => None,
        }
    }
}

/// A parsed listener endpoint: `{plain|tls|starttls}://host:port`.
///
/// Host may be a bracketed IPv6 literal. Any other scheme (including
/// `smtp://`/`smtps://`) is a configuration error and prevents startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerUri {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl ListenerUri {
    /// Socket address form usable with `TcpListener::bind`/`tls::Listen`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for ListenerUri {
    type Err = GatewayError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| GatewayError::Config(format!("invalid listener uri `{uri}`: {e}")))?;

        let transport = Transport::from_scheme(parsed.scheme()).ok_or_else(|| {
            GatewayError::Config(format!(
                "invalid smtp listener scheme `{}`, must be one of `plain`, `tls` or `starttls`",
                parsed.scheme()
            ))
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::Config(format!("listener uri `{uri}` is missing a host")))?
            .to_string();

        let port = parsed
            .port()
            .ok_or_else(|| GatewayError::Config(format!("listener uri `{uri}` is missing a port")))?;

        Ok(ListenerUri {
            transport,
            host,
            port,
        })
    }
}

impl fmt::Display for ListenerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host_is_ipv6 = self.host.parse::<std::net::Ipv6Addr>().is_ok();
        if host_is_ipv6 {
            write!(f, "{}://[{}]:{}", self.transport.as_scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.transport.as_scheme(), self.host, self.port)
        }
    }
}
