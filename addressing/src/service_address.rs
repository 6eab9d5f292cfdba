//! Este modulo implementa ServiceAddress: la direccion de un servidor
//! (manager, root o block) como par (ipv6, puerto). Las direcciones
//! IPv4 se codifican en el rango v4-mapped de ipv6.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct ServiceAddress {
    ip: Ipv6Addr,
    port: u16,
}

impl ServiceAddress {
    pub fn new(ip: Ipv6Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self { ip, port: addr.port() }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        if let Some(v4) = self.ip.to_ipv4_mapped() {
            SocketAddr::new(IpAddr::V4(v4), self.port)
        } else {
            SocketAddr::new(IpAddr::V6(self.ip), self.port)
        }
    }

    pub fn ip_bytes(&self) -> [u8; 16] {
        self.ip.octets()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(18);
        bytes.extend(self.ip.octets());
        bytes.extend(self.port.to_be_bytes());
        bytes
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 18 {
            return None;
        }
        let mut ip_octets = [0u8; 16];
        ip_octets.copy_from_slice(&bytes[0..16]);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Some(Self {
            ip: Ipv6Addr::from(ip_octets),
            port,
        })
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

#[derive(Debug)]
pub struct ParseServiceAddressError;

impl FromStr for ServiceAddress {
    type Err = ParseServiceAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.parse().map_err(|_| ParseServiceAddressError)?;
        Ok(Self::from_socket_addr(addr))
    }
}

impl From<Ipv4Addr> for ServiceAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self {
            ip: ip.to_ipv6_mapped(),
            port: 0,
        }
    }
}
