//! Multiaddress parsing and formatting (§6.5).
//!
//! Format: `/ip4|ip6/<addr>/tcp|udp|quic/<port>/p2p/<base58-nodeId>`, where
//! `nodeId` base58-decodes to exactly 32 bytes (an Ed25519 public key).

use std::fmt;
use std::net::IpAddr;

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Quic,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Quic => "quic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multiaddr {
    pub ip: IpAddr,
    pub transport: Transport,
    pub port: u16,
    pub node_id: [u8; 32],
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip_family = if self.ip.is_ipv4() { "ip4" } else { "ip6" };
        write!(
            f,
            "/{}/{}/{}/{}/p2p/{}",
            ip_family,
            self.ip,
            self.transport,
            self.port,
            base58_encode(&self.node_id)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MultiaddrError {
    #[error("expected 6 '/'-delimited segments, got {0}")]
    WrongSegmentCount(usize),
    #[error("unknown ip family '{0}', expected ip4 or ip6")]
    UnknownIpFamily(String),
    #[error("invalid ip address '{0}'")]
    InvalidIp(String),
    #[error("unknown transport '{0}', expected tcp, udp, or quic")]
    UnknownTransport(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("expected 'p2p' segment, got '{0}'")]
    ExpectedP2p(String),
    #[error("nodeId did not base58-decode to 32 bytes")]
    BadNodeId,
}

impl Multiaddr {
    pub fn parse(s: &str) -> Result<Self, MultiaddrError> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        if parts.len() != 6 {
            return Err(MultiaddrError::WrongSegmentCount(parts.len()));
        }
        let ip_family = parts[0];
        if ip_family != "ip4" && ip_family != "ip6" {
            return Err(MultiaddrError::UnknownIpFamily(ip_family.to_string()));
        }
        let ip: IpAddr = parts[1]
            .parse()
            .map_err(|_| MultiaddrError::InvalidIp(parts[1].to_string()))?;
        if (ip_family == "ip4") != ip.is_ipv4() {
            return Err(MultiaddrError::InvalidIp(parts[1].to_string()));
        }
        let transport = match parts[2] {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            "quic" => Transport::Quic,
            other => return Err(MultiaddrError::UnknownTransport(other.to_string())),
        };
        let port: u16 = parts[3]
            .parse()
            .map_err(|_| MultiaddrError::InvalidPort(parts[3].to_string()))?;
        if parts[4] != "p2p" {
            return Err(MultiaddrError::ExpectedP2p(parts[4].to_string()));
        }
        let decoded = base58_decode(parts[5]).ok_or(MultiaddrError::BadNodeId)?;
        let node_id: [u8; 32] = decoded.try_into().map_err(|_| MultiaddrError::BadNodeId)?;

        Ok(Multiaddr {
            ip,
            transport,
            port,
            node_id,
        })
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

pub fn base58_encode(input: &[u8]) -> String {
    let zero_count = input.iter().take_while(|&&b| b == 0).count();
    let mut digits: Vec<u8> = vec![0];
    for &byte in input {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out: Vec<u8> = std::iter::repeat(BASE58_ALPHABET[0])
        .take(zero_count)
        .collect();
    out.extend(digits.iter().rev().map(|&d| BASE58_ALPHABET[d as usize]));
    String::from_utf8(out).expect("base58 alphabet is ascii")
}

pub fn base58_decode(input: &str) -> Option<Vec<u8>> {
    let zero_count = input
        .as_bytes()
        .iter()
        .take_while(|&&b| b == BASE58_ALPHABET[0])
        .count();
    let mut bytes: Vec<u8> = vec![0];
    for ch in input.bytes() {
        let value = BASE58_ALPHABET.iter().position(|&c| c == ch)? as u32;
        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xFF) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; zero_count];
    out.extend(bytes.iter().rev());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_round_trips() {
        let input = [0u8, 1, 2, 3, 255, 254, 0, 0];
        let encoded = base58_encode(&input);
        let decoded = base58_decode(&encoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn multiaddr_round_trips() {
        let node_id = [7u8; 32];
        let addr = Multiaddr {
            ip: "127.0.0.1".parse().unwrap(),
            transport: Transport::Udp,
            port: 30303,
            node_id,
        };
        let s = addr.to_string();
        let parsed = Multiaddr::parse(&s).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert_eq!(
            Multiaddr::parse("/ip4/127.0.0.1/udp/30303"),
            Err(MultiaddrError::WrongSegmentCount(4))
        );
    }

    #[test]
    fn rejects_bad_node_id_length() {
        let short = base58_encode(&[1, 2, 3]);
        let s = format!("/ip4/127.0.0.1/udp/30303/p2p/{short}");
        assert_eq!(Multiaddr::parse(&s), Err(MultiaddrError::BadNodeId));
    }
}
