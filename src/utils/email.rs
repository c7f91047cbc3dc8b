use crate::error::{GatewayError, Result};

/// Envelope address sanity check: not a full RFC 5321 grammar, just enough
/// to reject the obviously malformed addresses a hostile peer might send to
/// probe for header/command injection in MAIL FROM/RCPT TO.
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(GatewayError::policy(501, "address is empty"));
    }

    if email.contains(['\r', '\n', '\0']) {
        return Err(GatewayError::policy(501, "address contains control characters"));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(GatewayError::policy(501, "address must contain exactly one @"));
    }

    let (local, domain) = (parts[0], parts[1]);

    if local.is_empty() || domain.is_empty() {
        return Err(GatewayError::policy(501, "local part and domain cannot be empty"));
    }

    Ok(())
}
