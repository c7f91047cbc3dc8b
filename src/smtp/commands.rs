//! SMTP command line parsing (RFC 5321), plus the `SIZE=N` parameter from
//! RFC 1870 on `MAIL FROM`.

use crate::error::{GatewayError, Result};

/// One parsed SMTP command line.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Sender address and the declared `SIZE=N` parameter, if given.
    MailFrom { address: String, size: Option<u64> },
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// `AUTH mechanism [initial-response]`.
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(GatewayError::Session("empty command line".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(GatewayError::Session("HELO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(GatewayError::Session("EHLO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => {
                let (address, size) = Self::parse_mail_from(args)?;
                Ok(SmtpCommand::MailFrom { address, size })
            }
            "RCPT" => Ok(SmtpCommand::RcptTo(Self::parse_rcpt_to(args)?)),
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(GatewayError::Session("AUTH requires a mechanism".to_string()));
                }
                let auth_parts: Vec<&str> = args.splitn(2, ' ').collect();
                let mechanism = auth_parts[0].to_string();
                let initial_response = auth_parts.get(1).map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism, initial_response))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// `FROM:<addr>[ SIZE=N][ other-params...]`. Unrecognized parameters are
    /// ignored rather than rejected, matching RFC 5321's extensibility rule.
    fn parse_mail_from(args: &str) -> Result<(String, Option<u64>)> {
        if !args.to_uppercase().starts_with("FROM:") {
            return Err(GatewayError::Session("invalid MAIL FROM syntax".to_string()));
        }

        let rest = args[5..].trim();
        let (addr_part, param_part) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], rest[idx..].trim()),
            None => (rest, ""),
        };

        let address = strip_brackets(addr_part);

        let mut size = None;
        for param in param_part.split_whitespace() {
            if let Some(value) = param.strip_prefix("SIZE=").or_else(|| param.strip_prefix("size=")) {
                size = value.parse::<u64>().ok();
            }
        }

        Ok((address, size))
    }

    fn parse_rcpt_to(args: &str) -> Result<String> {
        if !args.to_uppercase().starts_with("TO:") {
            return Err(GatewayError::Session("invalid RCPT TO syntax".to_string()));
        }

        let rest = args[3..].trim();
        let addr_part = rest.split(' ').next().unwrap_or(rest);
        Ok(strip_brackets(addr_part))
    }
}

fn strip_brackets(addr: &str) -> String {
    if addr.starts_with('<') && addr.ends_with('>') && addr.len() >= 2 {
        addr[1..addr.len() - 1].to_string()
    } else {
        addr.to_string()
    }
}
