//! Network types for container network identity.
//!
//! Provides the network mode, port mappings, subnet arithmetic and the
//! per-container endpoint record produced by address allocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{CtrError, Result};

/// Network mode for a container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Private network namespace with an address from the bridge subnet.
    #[default]
    Bridge,

    /// Share the host network stack.
    Host,

    /// Private network namespace with loopback only.
    None,
}

impl NetworkMode {
    /// Whether the container needs its own network namespace.
    pub fn needs_network_namespace(&self) -> bool {
        !matches!(self, NetworkMode::Host)
    }

    /// Whether the container gets an address from IPAM.
    pub fn allocates_address(&self) -> bool {
        matches!(self, NetworkMode::Bridge)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Bridge => write!(f, "bridge"),
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::None => write!(f, "none"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "bridge" | "default" => Ok(NetworkMode::Bridge),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            other => Err(CtrError::Validation(format!(
                "unknown network mode '{}' (expected bridge, host or none)",
                other
            ))),
        }
    }
}

/// Port forwarding from host to container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Host address to bind (empty means all addresses).
    #[serde(default)]
    pub host_ip: String,
}

impl FromStr for PortMapping {
    type Err = CtrError;

    /// Parse `[host_ip:]host_port:container_port[/proto]`.
    fn from_str(s: &str) -> Result<Self> {
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto.to_ascii_lowercase()),
            None => (s, "tcp".to_string()),
        };
        if protocol != "tcp" && protocol != "udp" {
            return Err(CtrError::Validation(format!(
                "invalid protocol '{}' in port mapping '{}'",
                protocol, s
            )));
        }

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [host, container] => (String::new(), *host, *container),
            [ip, host, container] => {
                ip.parse::<Ipv4Addr>().map_err(|_| {
                    CtrError::Validation(format!("invalid host IP '{}' in '{}'", ip, s))
                })?;
                (ip.to_string(), *host, *container)
            }
            _ => {
                return Err(CtrError::Validation(format!(
                    "invalid port mapping '{}' (expected [ip:]host:container[/proto])",
                    s
                )))
            }
        };

        let parse_port = |p: &str| {
            p.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| CtrError::Validation(format!("invalid port '{}' in '{}'", p, s)))
        };

        Ok(PortMapping {
            host_port: parse_port(host_port)?,
            container_port: parse_port(container_port)?,
            protocol,
            host_ip,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host_ip.is_empty() {
            write!(f, "{}:", self.host_ip)?;
        }
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

/// An IPv4 subnet with the conventional reserved addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    /// Network address (host bits cleared).
    network: Ipv4Addr,
    /// Prefix length.
    prefix_len: u8,
}

impl Subnet {
    /// Parse a CIDR string. Host bits are cleared, so `10.0.0.7/24` and
    /// `10.0.0.0/24` denote the same subnet.
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(|| {
            CtrError::Validation(format!("invalid CIDR notation: {}", cidr))
        })?;

        let addr: Ipv4Addr = addr.parse().map_err(|e| {
            CtrError::Validation(format!("invalid network address '{}': {}", addr, e))
        })?;
        let prefix_len: u8 = prefix.parse().map_err(|e| {
            CtrError::Validation(format!("invalid prefix length '{}': {}", prefix, e))
        })?;
        if prefix_len > 32 {
            return Err(CtrError::Validation(format!(
                "prefix length {} out of range",
                prefix_len
            )));
        }

        let network = Ipv4Addr::from(u32::from(addr) & Self::mask_bits(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    fn mask_bits(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len as u32)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// First usable address, reserved for the gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network).wrapping_add(1))
    }

    /// Calculate the broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_bits(self.prefix_len))
    }

    /// Total number of addresses in the subnet, reserved ones included.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len as u32)
    }

    /// Number of addresses available to containers (network, gateway and
    /// broadcast excluded), floored at zero.
    pub fn capacity(&self) -> u64 {
        self.size().saturating_sub(3)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix_len) == u32::from(self.network)
    }

    /// Whether `ip` is one of the permanently reserved addresses.
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.network || ip == self.gateway() || ip == self.broadcast()
    }

    /// Candidate container addresses in allocation order: network+2 up to,
    /// but excluding, the broadcast address.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u32::from(self.network) as u64 + 2;
        let end = u32::from(self.broadcast()) as u64;
        (start..end).map(|ip| Ipv4Addr::from(ip as u32))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self> {
        Subnet::parse(s)
    }
}

/// A container's address on a bridge subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkEndpoint {
    /// Subnet in CIDR notation.
    pub subnet: String,

    /// Assigned IPv4 address.
    pub ip_address: Ipv4Addr,

    /// Gateway of the subnet.
    pub gateway: Ipv4Addr,

    /// Assigned MAC address (hex string, e.g., "02:42:ac:11:00:02").
    pub mac_address: String,
}

impl NetworkEndpoint {
    pub fn new(subnet: &Subnet, ip: Ipv4Addr) -> Self {
        Self {
            subnet: subnet.to_string(),
            ip_address: ip,
            gateway: subnet.gateway(),
            mac_address: mac_from_ip(&ip),
        }
    }
}

/// Generate a deterministic MAC address from an IPv4 address.
/// Uses the locally-administered prefix 02:42 (same as Docker).
pub fn mac_from_ip(ip: &Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "02:42:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- NetworkMode tests ---

    #[test]
    fn test_network_mode_default_is_bridge() {
        assert_eq!(NetworkMode::default(), NetworkMode::Bridge);
    }

    #[test]
    fn test_network_mode_parse() {
        assert_eq!("bridge".parse::<NetworkMode>().unwrap(), NetworkMode::Bridge);
        assert_eq!("HOST".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
        assert_eq!("none".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert_eq!("".parse::<NetworkMode>().unwrap(), NetworkMode::Bridge);
        assert!("overlay".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn test_network_mode_namespace_requirement() {
        assert!(NetworkMode::Bridge.needs_network_namespace());
        assert!(NetworkMode::None.needs_network_namespace());
        assert!(!NetworkMode::Host.needs_network_namespace());
        assert!(NetworkMode::Bridge.allocates_address());
        assert!(!NetworkMode::None.allocates_address());
    }

    #[test]
    fn test_network_mode_serde() {
        let json = serde_json::to_string(&NetworkMode::Host).unwrap();
        assert_eq!(json, "\"host\"");
        let mode: NetworkMode = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(mode, NetworkMode::None);
    }

    // --- PortMapping tests ---

    #[test]
    fn test_port_mapping_basic() {
        let pm: PortMapping = "8080:80".parse().unwrap();
        assert_eq!(pm.host_port, 8080);
        assert_eq!(pm.container_port, 80);
        assert_eq!(pm.protocol, "tcp");
        assert_eq!(pm.host_ip, "");
    }

    #[test]
    fn test_port_mapping_with_ip_and_proto() {
        let pm: PortMapping = "127.0.0.1:5353:53/udp".parse().unwrap();
        assert_eq!(pm.host_ip, "127.0.0.1");
        assert_eq!(pm.host_port, 5353);
        assert_eq!(pm.container_port, 53);
        assert_eq!(pm.protocol, "udp");
        assert_eq!(pm.to_string(), "127.0.0.1:5353:53/udp");
    }

    #[test]
    fn test_port_mapping_invalid() {
        assert!("80".parse::<PortMapping>().is_err());
        assert!("0:80".parse::<PortMapping>().is_err());
        assert!("70000:80".parse::<PortMapping>().is_err());
        assert!("8080:80/sctp".parse::<PortMapping>().is_err());
        assert!("nothost:8080:80".parse::<PortMapping>().is_err());
    }

    // --- Subnet tests ---

    #[test]
    fn test_subnet_parse_and_reserved() {
        let subnet = Subnet::parse("10.88.0.0/24").unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 88, 0, 0));
        assert_eq!(subnet.gateway(), Ipv4Addr::new(10, 88, 0, 1));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(10, 88, 0, 255));
        assert_eq!(subnet.size(), 256);
        assert_eq!(subnet.capacity(), 253);
        assert!(subnet.is_reserved(Ipv4Addr::new(10, 88, 0, 255)));
        assert!(!subnet.is_reserved(Ipv4Addr::new(10, 88, 0, 2)));
    }

    #[test]
    fn test_subnet_normalises_host_bits() {
        let a = Subnet::parse("10.0.0.7/24").unwrap();
        let b = Subnet::parse("10.0.0.0/24").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_subnet_16() {
        let subnet = Subnet::parse("172.17.0.0/16").unwrap();
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(172, 17, 255, 255));
        assert_eq!(subnet.capacity(), 65533);
        assert!(subnet.contains(Ipv4Addr::new(172, 17, 3, 4)));
        assert!(!subnet.contains(Ipv4Addr::new(172, 18, 0, 1)));
    }

    #[test]
    fn test_subnet_hosts_skip_reserved() {
        let subnet = Subnet::parse("192.168.1.0/29").unwrap();
        let hosts: Vec<Ipv4Addr> = subnet.hosts().collect();
        assert_eq!(hosts.len() as u64, subnet.capacity());
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(192, 168, 1, 6)));
        assert!(hosts.iter().all(|ip| !subnet.is_reserved(*ip)));
    }

    #[test]
    fn test_subnet_tiny_prefixes() {
        let p31 = Subnet::parse("10.0.0.0/31").unwrap();
        assert_eq!(p31.capacity(), 0);
        assert_eq!(p31.hosts().count(), 0);

        let p32 = Subnet::parse("10.0.0.1/32").unwrap();
        assert_eq!(p32.capacity(), 0);
        assert_eq!(p32.hosts().count(), 0);
    }

    #[test]
    fn test_subnet_parse_invalid() {
        assert!(Subnet::parse("10.0.0.0").is_err());
        assert!(Subnet::parse("10.0.0/24").is_err());
        assert!(Subnet::parse("10.0.0.0/33").is_err());
        assert!(Subnet::parse("10.0.0.0/abc").is_err());
    }

    // --- Endpoint tests ---

    #[test]
    fn test_mac_from_ip() {
        let mac = mac_from_ip(&Ipv4Addr::new(172, 17, 0, 2));
        assert_eq!(mac, "02:42:ac:11:00:02");
    }

    #[test]
    fn test_endpoint_new() {
        let subnet = Subnet::parse("10.88.0.0/24").unwrap();
        let ep = NetworkEndpoint::new(&subnet, Ipv4Addr::new(10, 88, 0, 5));
        assert_eq!(ep.subnet, "10.88.0.0/24");
        assert_eq!(ep.gateway, Ipv4Addr::new(10, 88, 0, 1));
        assert_eq!(ep.mac_address, "02:42:0a:58:00:05");
    }
}
