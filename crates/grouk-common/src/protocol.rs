//! Connect request sent by the client as the first bytes of a stream.
//!
//! ```text
//! [Len (2B, BE)] [AddrType (1B)] [Addr] [Port (2B, BE)]
//!
//! AddrType 0x01: Addr = 4-byte IPv4
//! AddrType 0x03: Addr = [DomainLen (1B)][Domain]
//! AddrType 0x04: Addr = 16-byte IPv6
//! ```
//!
//! The server answers with a single status byte before any relayed data.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

pub const CONNECT_SUCCESS: u8 = 0x00;
pub const CONNECT_FAILED: u8 = 0x01;

/// Largest request body a server will read.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Size of the big-endian length prefix.
pub const LEN_PREFIX_SIZE: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("connect request too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown address type: 0x{0:02x}")]
    UnknownAddrType(u8),
    #[error("domain length {0} out of range")]
    DomainLength(usize),
    #[error("domain is not valid UTF-8")]
    InvalidDomain,
    #[error("connect request of {0} bytes exceeds limit")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl TargetHost {
    pub fn addr_type(&self) -> u8 {
        match self {
            Self::Ipv4(_) => ADDR_TYPE_IPV4,
            Self::Domain(_) => ADDR_TYPE_DOMAIN,
            Self::Ipv6(_) => ADDR_TYPE_IPV6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: TargetHost,
    pub port: u16,
}

impl ConnectRequest {
    pub fn new(host: TargetHost, port: u16) -> Self {
        Self { host, port }
    }

    /// Body without the length prefix.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1 + 1 + 255 + 2);
        buf.put_u8(self.host.addr_type());
        match &self.host {
            TargetHost::Ipv4(ip) => buf.put_slice(&ip.octets()),
            TargetHost::Domain(domain) => {
                if domain.is_empty() || domain.len() > u8::MAX as usize {
                    return Err(ProtocolError::DomainLength(domain.len()));
                }
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
            TargetHost::Ipv6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16(self.port);
        Ok(buf.freeze())
    }

    /// Body with the length prefix, ready to write to a stream.
    pub fn encode_framed(&self) -> Result<Bytes, ProtocolError> {
        let body = self.encode()?;
        let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + body.len());
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse a body. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (&addr_type, rest) = buf.split_first().ok_or(ProtocolError::TooShort(0))?;

        let (host, rest) = match addr_type {
            ADDR_TYPE_IPV4 => {
                let octets: [u8; 4] = take(rest, buf.len())?;
                (TargetHost::Ipv4(Ipv4Addr::from(octets)), &rest[4..])
            }
            ADDR_TYPE_DOMAIN => {
                let (&len, rest) = rest.split_first().ok_or(ProtocolError::TooShort(buf.len()))?;
                let len = len as usize;
                if len == 0 {
                    return Err(ProtocolError::DomainLength(0));
                }
                if rest.len() < len {
                    return Err(ProtocolError::TooShort(buf.len()));
                }
                let domain = std::str::from_utf8(&rest[..len])
                    .map_err(|_| ProtocolError::InvalidDomain)?
                    .to_owned();
                (TargetHost::Domain(domain), &rest[len..])
            }
            ADDR_TYPE_IPV6 => {
                let octets: [u8; 16] = take(rest, buf.len())?;
                (TargetHost::Ipv6(Ipv6Addr::from(octets)), &rest[16..])
            }
            other => return Err(ProtocolError::UnknownAddrType(other)),
        };

        let port: [u8; 2] = take(rest, buf.len())?;
        Ok(Self {
            host,
            port: u16::from_be_bytes(port),
        })
    }

    /// Validate a length prefix read off a stream.
    pub fn body_len(prefix: [u8; LEN_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
        let len = u16::from_be_bytes(prefix) as usize;
        if len > MAX_REQUEST_LEN {
            return Err(ProtocolError::TooLarge(len));
        }
        if len == 0 {
            return Err(ProtocolError::TooShort(0));
        }
        Ok(len)
    }
}

fn take<const N: usize>(buf: &[u8], total: usize) -> Result<[u8; N], ProtocolError> {
    buf.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ProtocolError::TooShort(total))
}

/// `host:port`, with IPv6 hosts bracketed. Suitable for a TCP dial.
impl fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            TargetHost::Domain(domain) => write!(f, "{domain}:{}", self.port),
            TargetHost::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_layout() {
        let request = ConnectRequest::new(TargetHost::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 443);
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[..], &[0x01, 10, 0, 0, 1, 0x01, 0xBB]);
        assert_eq!(ConnectRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn domain_layout() {
        let request = ConnectRequest::new(TargetHost::Domain("example.com".into()), 80);
        let bytes = request.encode().unwrap();
        assert_eq!(bytes[0], ADDR_TYPE_DOMAIN);
        assert_eq!(bytes[1], 11);
        assert_eq!(&bytes[2..13], b"example.com");
        assert_eq!(&bytes[13..], &[0x00, 0x50]);
        assert_eq!(request.to_string(), "example.com:80");
    }

    #[test]
    fn ipv6_display_is_bracketed() {
        let request = ConnectRequest::new(TargetHost::Ipv6(Ipv6Addr::LOCALHOST), 8080);
        let bytes = request.encode().unwrap();
        assert_eq!(bytes.len(), 1 + 16 + 2);
        assert_eq!(ConnectRequest::decode(&bytes).unwrap(), request);
        assert_eq!(request.to_string(), "[::1]:8080");
    }

    #[test]
    fn framed_has_length_prefix() {
        let request = ConnectRequest::new(TargetHost::Domain("a.b".into()), 1);
        let framed = request.encode_framed().unwrap();
        let len = ConnectRequest::body_len([framed[0], framed[1]]).unwrap();
        assert_eq!(len, framed.len() - LEN_PREFIX_SIZE);
        assert_eq!(ConnectRequest::decode(&framed[LEN_PREFIX_SIZE..]).unwrap(), request);
    }

    #[test]
    fn oversized_and_empty_prefix_rejected() {
        assert_eq!(
            ConnectRequest::body_len(1025u16.to_be_bytes()),
            Err(ProtocolError::TooLarge(1025))
        );
        assert_eq!(
            ConnectRequest::body_len([0, 0]),
            Err(ProtocolError::TooShort(0))
        );
        assert_eq!(ConnectRequest::body_len(1024u16.to_be_bytes()), Ok(1024));
    }

    #[test]
    fn domain_length_bounds() {
        let empty = ConnectRequest::new(TargetHost::Domain(String::new()), 1);
        assert_eq!(empty.encode(), Err(ProtocolError::DomainLength(0)));

        let long = ConnectRequest::new(TargetHost::Domain("x".repeat(256)), 1);
        assert_eq!(long.encode(), Err(ProtocolError::DomainLength(256)));
    }

    #[test]
    fn truncated_requests_rejected() {
        assert_eq!(ConnectRequest::decode(&[]), Err(ProtocolError::TooShort(0)));
        assert_eq!(
            ConnectRequest::decode(&[0x01, 1, 2, 3]),
            Err(ProtocolError::TooShort(4))
        );
        assert_eq!(
            ConnectRequest::decode(&[0x01, 1, 2, 3, 4, 0]),
            Err(ProtocolError::TooShort(6))
        );
        assert_eq!(
            ConnectRequest::decode(&[0x03, 5, b'a', b'b']),
            Err(ProtocolError::TooShort(4))
        );
    }

    #[test]
    fn bad_address_type_and_domain() {
        assert_eq!(
            ConnectRequest::decode(&[0x02, 0, 0]),
            Err(ProtocolError::UnknownAddrType(0x02))
        );
        assert_eq!(
            ConnectRequest::decode(&[0x03, 2, 0xFF, 0xFE, 0, 80]),
            Err(ProtocolError::InvalidDomain)
        );
        assert_eq!(
            ConnectRequest::decode(&[0x03, 0, 0, 80]),
            Err(ProtocolError::DomainLength(0))
        );
    }
}
