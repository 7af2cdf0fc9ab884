//! SOCKS5 address type (ATYP) encoding, shared by CONNECT/REQUEST and
//! REPLY frames as well as the SOCKS5 endpoint itself.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::ProtocolError;

/// The three standard SOCKS5 address types (RFC 1928 §5). The values `0`
/// and `2` are reserved elsewhere in the frame codec for DELETE and DATA
/// frames and must never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atyp {
    IPv4 = 1,
    Domain = 3,
    IPv6 = 4,
}

impl Atyp {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            1 => Ok(Atyp::IPv4),
            3 => Ok(Atyp::Domain),
            4 => Ok(Atyp::IPv6),
            other => Err(ProtocolError::UnknownAtyp(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A destination or bound address as carried in a CONNECT request or a
/// REPLY frame. Domain names are carried verbatim (never pre-resolved)
/// so the far side can do its own resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl SocksAddr {
    pub fn atyp(&self) -> Atyp {
        match self {
            SocksAddr::V4(_) => Atyp::IPv4,
            SocksAddr::V6(_) => Atyp::IPv6,
            SocksAddr::Domain(_) => Atyp::Domain,
        }
    }

    /// Appends this address's wire encoding (no ATYP byte) to `out`.
    /// IPv4/IPv6 are fixed-width; domains are length-prefixed with a
    /// single byte, matching SOCKS5's own DST.ADDR encoding.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            SocksAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            SocksAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
            SocksAddr::Domain(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
    }

    /// Parses an address of the given type from `buf`, returning the
    /// address and the number of bytes consumed.
    pub fn decode_from(atyp: Atyp, buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        match atyp {
            Atyp::IPv4 => {
                if buf.len() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let octets: [u8; 4] = buf[..4].try_into().unwrap();
                Ok((SocksAddr::V4(Ipv4Addr::from(octets)), 4))
            }
            Atyp::IPv6 => {
                if buf.len() < 16 {
                    return Err(ProtocolError::Truncated);
                }
                let octets: [u8; 16] = buf[..16].try_into().unwrap();
                Ok((SocksAddr::V6(Ipv6Addr::from(octets)), 16))
            }
            Atyp::Domain => {
                let len = *buf.first().ok_or(ProtocolError::Truncated)? as usize;
                if buf.len() < 1 + len {
                    return Err(ProtocolError::Truncated);
                }
                let name = std::str::from_utf8(&buf[1..1 + len])
                    .map_err(|_| ProtocolError::InvalidDomain)?
                    .to_owned();
                Ok((SocksAddr::Domain(name), 1 + len))
            }
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::V4(ip) => write!(f, "{ip}"),
            SocksAddr::V6(ip) => write!(f, "{ip}"),
            SocksAddr::Domain(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr = SocksAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut buf = Vec::new();
        addr.encode_to(&mut buf);
        let (decoded, used) = SocksAddr::decode_from(Atyp::IPv4, &buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, 4);
    }

    #[test]
    fn domain_round_trip() {
        let addr = SocksAddr::Domain("example.com".to_string());
        let mut buf = Vec::new();
        addr.encode_to(&mut buf);
        let (decoded, used) = SocksAddr::decode_from(Atyp::Domain, &buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, 1 + "example.com".len());
    }

    #[test]
    fn truncated_domain_is_rejected() {
        let buf = [5u8, b'a', b'b']; // claims 5 bytes, only has 2
        assert!(matches!(
            SocksAddr::decode_from(Atyp::Domain, &buf),
            Err(ProtocolError::Truncated)
        ));
    }
}
