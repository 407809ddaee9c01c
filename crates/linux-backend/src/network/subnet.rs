use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use super::error::SubnetParseError;

/// An IPv4 network in CIDR form. The base address is always masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    net: Ipv4Network,
}

impl Ipv4Subnet {
    /// Prefixes longer than 32 are clamped to 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        let prefix = prefix.min(32);
        let net = Ipv4Network::new(addr, prefix)
            .and_then(|net| Ipv4Network::new(net.network(), prefix))
            .unwrap_or_else(|_| Ipv4Network::from(addr));
        Self { net }
    }

    pub fn base(&self) -> Ipv4Addr {
        self.net.network()
    }

    pub fn prefix(&self) -> u8 {
        self.net.prefix()
    }

    /// Number of addresses covered.
    pub fn size(&self) -> u64 {
        match self.net.prefix() {
            // 2^32 does not fit the crate's u32 size
            0 => 1 << 32,
            _ => u64::from(self.net.size()),
        }
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(ip)
    }

    /// Whether `other` lies entirely inside this network.
    pub fn contains(&self, other: &Ipv4Subnet) -> bool {
        self.net.contains(other.base()) && self.net.contains(other.broadcast_ip())
    }

    /// Aligned CIDR blocks either nest or are disjoint.
    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        self.net.contains(other.base()) || other.net.contains(self.base())
    }

    /// First host address, assigned to the bridge.
    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.offset(1)
    }

    /// Second host address, assigned to the container.
    pub fn container_ip(&self) -> Ipv4Addr {
        self.offset(2)
    }

    pub fn broadcast_ip(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    fn offset(&self, n: u32) -> Ipv4Addr {
        let ip = u32::from(self.base()).saturating_add(n);
        Ipv4Addr::from(ip.min(u32::from(self.broadcast_ip())))
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base(), self.prefix())
    }
}

impl FromStr for Ipv4Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| SubnetParseError::Format(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| SubnetParseError::Address(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| SubnetParseError::Prefix(s.to_string()))?;
        let net = Ipv4Network::new(addr, prefix)
            .map_err(|_| SubnetParseError::Prefix(s.to_string()))?;
        Ok(Self::new(net.network(), net.prefix()))
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = SubnetParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(subnet: Ipv4Subnet) -> Self {
        subnet.to_string()
    }
}
