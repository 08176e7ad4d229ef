// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal SOCKS5 UDP ASSOCIATE client (RFC 1928), used to probe game
//! servers through a relay.
//!
//! One association per probe attempt: a TCP control connection negotiates
//! the relay, an ephemeral UDP socket exchanges datagrams with it. Each
//! relayed datagram carries the RFC 1928 UDP request header:
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! Dropping the association closes both sockets; the relay tears the
//! binding down when the control connection goes away.

use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const RELAY_BUFFER_SIZE: usize = 2048;

/// SOCKS client error types.
#[derive(Debug)]
pub enum SocksError {
    InvalidUrl(String),
    Handshake(&'static str),
    Rejected(u8),
    Fragmented,
    Malformed(&'static str),
    Io(std::io::Error),
}

impl std::fmt::Display for SocksError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(url) => write!(f, "invalid SOCKS url: {}", url),
            Self::Handshake(s) => write!(f, "SOCKS handshake failed: {}", s),
            Self::Rejected(code) => write!(f, "SOCKS request rejected: reply code {}", code),
            Self::Fragmented => write!(f, "fragmented SOCKS datagrams are not supported"),
            Self::Malformed(s) => write!(f, "malformed SOCKS datagram: {}", s),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SocksError {}

impl From<std::io::Error> for SocksError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Extract `host:port` from a `socks5://host:port` URL.
fn relay_authority(url: &str) -> Result<&str, SocksError> {
    let authority = url
        .strip_prefix("socks5://")
        .or_else(|| url.strip_prefix("socks://"))
        .unwrap_or(url)
        .trim_end_matches('/');
    if authority.is_empty() || !authority.contains(':') {
        return Err(SocksError::InvalidUrl(url.to_string()));
    }
    Ok(authority)
}

/// An established UDP ASSOCIATE binding.
pub struct SocksUdpAssociation {
    /// Keeps the association alive; the relay closes it when this drops.
    _control: TcpStream,
    relay: UdpSocket,
}

impl SocksUdpAssociation {
    /// Negotiate an association with the relay at `url` (no authentication).
    pub async fn connect(url: &str) -> Result<Self, SocksError> {
        let mut control = TcpStream::connect(relay_authority(url)?).await?;

        // Method negotiation: offer NO AUTHENTICATION only.
        control
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await?;
        let mut choice = [0u8; 2];
        control.read_exact(&mut choice).await?;
        if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
            return Err(SocksError::Handshake("no acceptable authentication method"));
        }

        // UDP ASSOCIATE with an unspecified client address; we only learn
        // our source address once we actually send.
        control
            .write_all(&[
                SOCKS_VERSION,
                CMD_UDP_ASSOCIATE,
                0x00,
                ATYP_IPV4,
                0,
                0,
                0,
                0,
                0,
                0,
            ])
            .await?;

        let mut head = [0u8; 4];
        control.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(SocksError::Handshake("unexpected reply version"));
        }
        if head[1] != 0x00 {
            return Err(SocksError::Rejected(head[1]));
        }
        let bound_ip: IpAddr = match head[3] {
            ATYP_IPV4 => {
                let mut raw = [0u8; 4];
                control.read_exact(&mut raw).await?;
                IpAddr::from(raw)
            }
            ATYP_IPV6 => {
                let mut raw = [0u8; 16];
                control.read_exact(&mut raw).await?;
                IpAddr::from(raw)
            }
            _ => return Err(SocksError::Handshake("unexpected bound address type")),
        };
        let mut raw_port = [0u8; 2];
        control.read_exact(&mut raw_port).await?;
        let bound_port = u16::from_be_bytes(raw_port);

        // Some relays report an unspecified bound address; fall back to the
        // address the control connection reached.
        let relay_ip = if bound_ip.is_unspecified() {
            control.peer_addr()?.ip()
        } else {
            bound_ip
        };
        let relay_addr = SocketAddr::new(relay_ip, bound_port);

        let local = if relay_addr.is_ipv6() {
            SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        };
        let relay = UdpSocket::bind(local).await?;
        relay.connect(relay_addr).await?;

        Ok(Self {
            _control: control,
            relay,
        })
    }

    /// Relay one datagram to `dest`.
    pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<(), SocksError> {
        let mut buf = encode_udp_header(dest);
        buf.extend_from_slice(payload);
        self.relay.send(&buf).await?;
        Ok(())
    }

    /// Receive one relayed datagram and strip its header.
    pub async fn recv(&self) -> Result<Vec<u8>, SocksError> {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let len = self.relay.recv(&mut buf).await?;
        let payload = strip_udp_header(&buf[..len])?;
        Ok(payload.to_vec())
    }
}

fn encode_udp_header(dest: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV + FRAG
    match dest.ip() {
        IpAddr::V4(v4) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&dest.port().to_be_bytes());
    buf
}

fn strip_udp_header(data: &[u8]) -> Result<&[u8], SocksError> {
    if data.len() < 4 {
        return Err(SocksError::Malformed("truncated header"));
    }
    if data[2] != 0x00 {
        return Err(SocksError::Fragmented);
    }
    let addr_len = match data[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let len = *data.get(4).ok_or(SocksError::Malformed("truncated header"))?;
            1 + usize::from(len)
        }
        _ => return Err(SocksError::Malformed("unknown address type")),
    };
    let header_len = 4 + addr_len + 2;
    if data.len() < header_len {
        return Err(SocksError::Malformed("truncated header"));
    }
    Ok(&data[header_len..])
}
