//! Peer IP allowlist (spec.md §4.3).

use ipnet::IpNet;
use std::net::IpAddr;
use tracing::debug;

/// Ordered list of validated CIDRs. Entries that fail CIDR parse are
/// dropped at construction; an empty whitelist denies every peer.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    nets: Vec<IpNet>,
}

impl Whitelist {
    pub fn new(cidrs: &[String]) -> Self {
        let mut nets = Vec::with_capacity(cidrs.len());

        for cidr in cidrs {
            match cidr.parse::<IpNet>() {
                Ok(net) => nets.push(net),
                Err(_) => debug!(cidr, "invalid smtp.whitelist entry, removing"),
            }
        }

        Whitelist { nets }
    }

    /// `true` if `peer` is contained in any configured CIDR, in insertion
    /// order (first match wins, though containment is order-independent).
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&peer))
    }
}
