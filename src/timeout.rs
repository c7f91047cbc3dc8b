//! Session I/O timeouts (spec.md §3).

use std::time::Duration;

const DEFAULT_READ: Duration = Duration::from_secs(60);
const DEFAULT_WRITE: Duration = Duration::from_secs(60);
const DEFAULT_DATA: Duration = Duration::from_secs(5 * 60);

/// Read/write/DATA timeouts for a session. Unparsable config values fall
/// back to 60s/60s/5m, handled by `config::Durations`'s deserializer before
/// this type is constructed.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    pub data: Duration,
}

impl Timeouts {
    pub fn new(read: Option<Duration>, write: Option<Duration>, data: Option<Duration>) -> Self {
        Timeouts {
            read: read.unwrap_or(DEFAULT_READ),
            write: write.unwrap_or(DEFAULT_WRITE),
            data: data.unwrap_or(DEFAULT_DATA),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            read: DEFAULT_READ,
            write: DEFAULT_WRITE,
            data: DEFAULT_DATA,
        }
    }
}
