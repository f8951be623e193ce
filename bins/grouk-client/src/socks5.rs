//! Minimal SOCKS5 server side (RFC 1928): no authentication, CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr};

use grouk_common::{ConnectRequest, TargetHost};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid SOCKS version: {0}")]
    InvalidVersion(u8),
    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("empty domain name")]
    EmptyDomain,
}

/// Reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Run method negotiation and read the CONNECT request.
///
/// Unsupported commands and address types are answered with the matching
/// reply before the error is returned. On success the caller owes the
/// client a reply via [`send_reply`].
pub async fn handshake<S>(conn: &mut S) -> Result<ConnectRequest, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    conn.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    conn.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        conn.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    conn.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // VER CMD RSV ATYP
    let mut request = [0u8; 4];
    conn.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(Socks5Error::InvalidVersion(request[0]));
    }
    if request[1] != CMD_CONNECT {
        send_reply(conn, Reply::CommandNotSupported).await?;
        return Err(Socks5Error::UnsupportedCommand(request[1]));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            conn.read_exact(&mut octets).await?;
            TargetHost::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = conn.read_u8().await? as usize;
            if len == 0 {
                send_reply(conn, Reply::GeneralFailure).await?;
                return Err(Socks5Error::EmptyDomain);
            }
            let mut domain = vec![0u8; len];
            conn.read_exact(&mut domain).await?;
            TargetHost::Domain(String::from_utf8_lossy(&domain).into_owned())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            conn.read_exact(&mut octets).await?;
            TargetHost::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            send_reply(conn, Reply::AddressTypeNotSupported).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };
    let port = conn.read_u16().await?;

    Ok(ConnectRequest::new(host, port))
}

/// Reply with an all-zero IPv4 bound address.
pub async fn send_reply<S>(conn: &mut S, reply: Reply) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    conn.write_all(&[SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
