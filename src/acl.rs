//! IPv4 client allow-list.

use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr};
use tracing::warn;

/// AccessControl answers whether a client address may use the proxy.
/// An empty list denies everyone.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    networks: Vec<Ipv4Net>,
}

impl AccessControl {
    /// from_cidrs parses the configured CIDR strings. Entries that fail to
    /// parse or describe IPv6 networks are logged and skipped.
    pub fn from_cidrs<S: AsRef<str>>(cidrs: &[S]) -> Self {
        let mut networks = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let cidr = cidr.as_ref();
            match cidr.parse::<IpNet>() {
                Ok(IpNet::V4(net)) => networks.push(net.trunc()),
                Ok(IpNet::V6(_)) => warn!("Skipping IPv6 CIDR {cidr:?}"),
                Err(e) => warn!("Invalid CIDR {cidr:?} (skipped): {e}"),
            }
        }
        Self { networks }
    }

    /// allows reports whether `ip` lies inside any configured network
    pub fn allows(&self, ip: Ipv4Addr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    /// allows_addr accepts any peer address; IPv6 peers are only allowed
    /// when they carry an IPv4-mapped address
    pub fn allows_addr(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.allows(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| self.allows(v4)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }
}
