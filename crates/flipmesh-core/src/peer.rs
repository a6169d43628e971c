//! Peer addressing: identifies a remote node by IP and listen port.
//!
//! A `Peer` is the key of the peer registry, so it is a plain `Copy` value
//! with structural equality. The address lives in a fixed 16-byte buffer with
//! an explicit length (4 or 16). Bytes past the length are always zero, which
//! is what makes the derived `Eq`/`Hash` compare by content.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Length of an IPv4 address in bytes.
pub const IPV4_LEN: usize = 4;

/// Length of an IPv6 address in bytes.
pub const IPV6_LEN: usize = 16;

/// Address used when a peer descriptor leaves the address empty.
pub const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// IP family of a peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A remote node: IP address plus the port it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer {
    address: [u8; IPV6_LEN],
    address_len: u8,
    port: u16,
}

impl Peer {
    /// Build a peer from an IP and port.
    ///
    /// IPv4-mapped IPv6 addresses are stored in their 4-byte form, so a peer
    /// seen on a dual-stack socket equals the same peer announced over IPv4.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let mut address = [0u8; IPV6_LEN];
        let address_len = match ip.to_canonical() {
            IpAddr::V4(v4) => {
                address[..IPV4_LEN].copy_from_slice(&v4.octets());
                IPV4_LEN
            }
            IpAddr::V6(v6) => {
                address.copy_from_slice(&v6.octets());
                IPV6_LEN
            }
        };
        Self {
            address,
            address_len: address_len as u8,
            port,
        }
    }

    /// Parse an address string and a decimal port string.
    ///
    /// An empty address means the local host. IPv6 addresses may be given
    /// with or without surrounding brackets.
    pub fn parse(address: &str, port: &str) -> Result<Self, PeerError> {
        let trimmed = address.trim();
        let ip = if trimmed.is_empty() {
            IpAddr::V4(DEFAULT_ADDRESS)
        } else {
            let bare = trimmed
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .unwrap_or(trimmed);
            bare.parse::<IpAddr>()
                .map_err(|_| PeerError::InvalidAddress(address.to_string()))?
        };
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| PeerError::InvalidPort(port.to_string()))?;
        Ok(Self::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        match self.family() {
            AddressFamily::V4 => {
                let mut octets = [0u8; IPV4_LEN];
                octets.copy_from_slice(&self.address[..IPV4_LEN]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::from(self.address)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        if self.address_len as usize == IPV4_LEN {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }

    /// Raw address bytes, exactly 4 or 16 long.
    pub fn address_bytes(&self) -> &[u8] {
        &self.address[..self.address_len as usize]
    }

    /// Socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }
}

/// Renders `ip:port` for IPv4 and `[ip]:port` for IPv6.
impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

/// Parses the `Display` form back (`ip:port` or `[ip]:port`).
impl FromStr for Peer {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| PeerError::InvalidPort(s.to_string()))?;
        Self::parse(address, port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),
}
