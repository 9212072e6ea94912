//! A single access rule: a CIDR prefix, an optional port set and a verdict.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

use crate::PolicyError;

/// One entry of an access policy.
///
/// Supports:
/// - CIDR notation (e.g., "10.0.0.0/8", "2001:db8::/32")
/// - Bare addresses (e.g., "192.168.1.8"), treated as a host prefix
///
/// An empty port list matches every port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    ip_net: IpNetwork,
    /// Sorted, deduplicated
    ports: Vec<u16>,
    allow: bool,
}

impl Rule {
    /// Build a rule from a prefix string.
    ///
    /// # Arguments
    /// * `prefix` - CIDR or bare IP address
    /// * `ports` - Ports this rule applies to; empty means all ports
    /// * `allow` - Verdict returned when this rule is the first match
    pub fn by_cidr(prefix: &str, ports: Vec<u16>, allow: bool) -> Result<Self, PolicyError> {
        let ip_net = IpNetwork::from_str(prefix.trim())
            .map_err(|e| PolicyError::InvalidPrefix(prefix.to_string(), e.to_string()))?;

        Self::new(ip_net, ports, allow)
    }

    pub fn new(ip_net: IpNetwork, mut ports: Vec<u16>, allow: bool) -> Result<Self, PolicyError> {
        if ports.contains(&0) {
            return Err(PolicyError::InvalidPort(0));
        }
        ports.sort_unstable();
        ports.dedup();

        Ok(Self {
            ip_net,
            ports,
            allow,
        })
    }

    /// Check whether this rule applies to the destination.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are matched as the IPv4
    /// address they carry.
    pub fn matches(&self, ip: &IpAddr, port: u16) -> bool {
        // IpNetwork::contains is false across address families
        if !self.ip_net.contains(ip.to_canonical()) {
            return false;
        }

        self.ports.is_empty() || self.ports.binary_search(&port).is_ok()
    }

    pub fn ip_net(&self) -> IpNetwork {
        self.ip_net
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn allow(&self) -> bool {
        self.allow
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = if self.allow { "allow" } else { "deny" };
        if self.ports.is_empty() {
            write!(f, "{} {} (all ports)", verdict, self.ip_net)
        } else {
            write!(f, "{} {} ports {:?}", verdict, self.ip_net, self.ports)
        }
    }
}
