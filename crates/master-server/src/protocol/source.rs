// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logical origin of a datagram, and PROXY protocol (v1) unwrapping.
//!
//! Front-ends such as load balancers prepend one ASCII line to the first
//! datagram of a UDP flow:
//!
//! ```text
//! PROXY UDP4 <client_ip> <proxy_ip> <client_port> <proxy_port>\r\n
//! ```
//!
//! followed immediately by the game-packet bytes. The third and fifth
//! fields carry the real client address; the socket address only identifies
//! the front-end.

use super::ProtocolError;
use crate::udp::UdpEndpoint;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

const PROXY_MAGIC: &[u8] = b"PROXY";

/// Per-datagram origin: the receiving endpoint, the raw socket address, and
/// the effective `(ip, port)` after PROXY unwrap. Immutable for the life of
/// one datagram.
#[derive(Clone)]
pub struct Source {
    pub endpoint: Arc<UdpEndpoint>,
    pub socket_addr: SocketAddr,
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("socket_addr", &self.socket_addr)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .finish()
    }
}

/// Whether this datagram starts with a PROXY protocol header.
pub fn has_proxy_header(data: &[u8]) -> bool {
    data.starts_with(PROXY_MAGIC)
}

/// Split a PROXY-headed datagram into the real client address and the
/// game-packet bytes that follow the header line.
pub fn parse_proxy_header(data: &[u8]) -> Result<((IpAddr, u16), &[u8]), ProtocolError> {
    let end = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(ProtocolError::InvalidData("unterminated PROXY header"))?;
    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| ProtocolError::InvalidData("PROXY header is not valid ASCII"))?;

    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() != 6 {
        return Err(ProtocolError::InvalidData("malformed PROXY header"));
    }
    let ip: IpAddr = fields[2]
        .parse()
        .map_err(|_| ProtocolError::InvalidData("bad client address in PROXY header"))?;
    let port: u16 = fields[4]
        .parse()
        .map_err(|_| ProtocolError::InvalidData("bad client port in PROXY header"))?;

    Ok(((ip, port), &data[end + 2..]))
}
