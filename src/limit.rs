//! Resource limits for an SMTP listener (spec.md §3, §4.5).

use tracing::debug;

pub const DEFAULT_MAX_CONNECTIONS: i64 = 100;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 26_214_400;
pub const DEFAULT_MAX_RECIPIENTS: usize = 100;

/// Connection/message/recipient caps for one listener.
///
/// Non-positive `max_message_bytes`/`max_recipients` silently fall back to
/// the defaults above. `max_connections == 0` also defaults; a negative
/// value means "unlimited".
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_connections: i64,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl Limits {
    pub fn new(max_connections: i64, max_message_bytes: i64, max_recipients: i64) -> Self {
        let max_connections = if max_connections == 0 {
            debug!(
                value = max_connections,
                default = DEFAULT_MAX_CONNECTIONS,
                "invalid smtp.limit.connections, using default"
            );
            DEFAULT_MAX_CONNECTIONS
        } else {
            max_connections
        };

        let max_message_bytes = if max_message_bytes <= 0 {
            debug!(
                value = max_message_bytes,
                default = DEFAULT_MAX_MESSAGE_BYTES,
                "invalid smtp.limit.message_size, using default"
            );
            DEFAULT_MAX_MESSAGE_BYTES
        } else {
            max_message_bytes as usize
        };

        let max_recipients = if max_recipients <= 0 {
            debug!(
                value = max_recipients,
                default = DEFAULT_MAX_RECIPIENTS,
                "invalid smtp.limit.recipients, using default"
            );
            DEFAULT_MAX_RECIPIENTS
        } else {
            max_recipients as usize
        };

        Limits {
            max_connections,
            max_message_bytes,
            max_recipients,
        }
    }

    /// `true` if there is no cap on concurrent connections for this listener.
    pub fn unlimited_connections(&self) -> bool {
        self.max_connections < 0
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::new(DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGE_BYTES as i64, DEFAULT_MAX_RECIPIENTS as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_connections_defaults() {
        let l = Limits::new(0, 100, 10);
        assert_eq!(l.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn negative_connections_means_unlimited() {
        let l = Limits::new(-1, 100, 10);
        assert_eq!(l.max_connections, -1);
        assert!(l.unlimited_connections());
    }

    #[test]
    fn non_positive_message_size_and_recipients_default() {
        let l = Limits::new(5, 0, -3);
        assert_eq!(l.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(l.max_recipients, DEFAULT_MAX_RECIPIENTS);
    }

    #[test]
    fn valid_values_pass_through() {
        let l = Limits::new(5, 1024, 7);
        assert_eq!(l.max_connections, 5);
        assert_eq!(l.max_message_bytes, 1024);
        assert_eq!(l.max_recipients, 7);
    }
}
