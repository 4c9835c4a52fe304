//! Peer address filtering.
//!
//! Rules are evaluated in order and the first matching CIDR decides;
//! addresses no rule matches fall back to the configured default.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::Deserialize;

/// Verdict for a peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerAction {
    Allow,
    Deny,
}

/// IPv4 or IPv6 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, String> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format!("prefix /{} too long for {}", prefix, network));
        }
        Ok(Self { network, prefix })
    }

    /// Whether `ip` lies inside this network. Families never match each other.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (ip, self.network) {
            (IpAddr::V4(ip4), IpAddr::V4(net4)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                (u32::from(ip4) & mask) == (u32::from(net4) & mask)
            }
            (IpAddr::V6(ip6), IpAddr::V6(net6)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                (u128::from(ip6) & mask) == (u128::from(net6) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid network {:?}: {}", s, e))?;
        let prefix = match prefix {
            Some(p) => p.trim().parse().map_err(|e| format!("invalid prefix in {:?}: {}", s, e))?,
            None if network.is_ipv4() => 32,
            None => 128,
        };
        Self::new(network, prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Single allow/deny rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PeerRule {
    pub action: PeerAction,
    pub cidr: Cidr,
}

/// Ordered peer filter
#[derive(Debug, Clone)]
pub struct PeerFilter {
    rules: Vec<PeerRule>,
    default: PeerAction,
}

impl PeerFilter {
    pub fn new(rules: Vec<PeerRule>, default: PeerAction) -> Self {
        Self { rules, default }
    }

    /// Filter that lets everything through
    pub fn allow_all() -> Self {
        Self::new(Vec::new(), PeerAction::Allow)
    }

    pub fn action(&self, ip: IpAddr) -> PeerAction {
        self.rules
            .iter()
            .find(|rule| rule.cidr.contains(ip))
            .map(|rule| rule.action)
            .unwrap_or(self.default)
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.action(ip) == PeerAction::Allow
    }
}
