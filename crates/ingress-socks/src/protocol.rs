//! SOCKS5 wire format (RFC 1928), server side

use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::SocksError;

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent back to the SOCKS client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply code for a failed dial
    pub fn from_io_error(err: &std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            ErrorKind::HostUnreachable | ErrorKind::TimedOut => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub destination: Address,
}

/// Read the method negotiation and answer it.
///
/// Only "no authentication" is offered; clients that do not list it get
/// `0xFF` and the handshake fails.
pub async fn negotiate<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a request.
///
/// Unknown address types are answered with `AddressTypeNotSupported` here
/// because the rest of the request cannot be parsed.
pub async fn read_request<S>(stream: &mut S) -> Result<Request, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }
    let command = header[1];

    let destination = match header[3] {
        ATYP_IPV4 => {
            let mut ip_port = [0u8; 6];
            stream.read_exact(&mut ip_port).await?;
            let ip = Ipv4Addr::new(ip_port[0], ip_port[1], ip_port[2], ip_port[3]);
            let port = u16::from_be_bytes([ip_port[4], ip_port[5]]);
            Address::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain_port = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut domain_port).await?;

            let (domain, port) = domain_port.split_at(len[0] as usize);
            let domain = String::from_utf8(domain.to_vec())
                .map_err(|_| SocksError::InvalidDomain)?;
            Address::Domain(domain, u16::from_be_bytes([port[0], port[1]]))
        }
        ATYP_IPV6 => {
            let mut ip_port = [0u8; 18];
            stream.read_exact(&mut ip_port).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&ip_port[..16]);
            let port = u16::from_be_bytes([ip_port[16], ip_port[17]]);
            Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    Ok(Request {
        command,
        destination,
    })
}

/// Send a reply with the bound address (unspecified when `None`)
pub async fn write_reply<S>(
    stream: &mut S,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
