// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OpenTTD master-server UDP wire protocol.
//!
//! Every packet is little-endian and starts with a 2-byte total length
//! (including the length field itself) followed by a 1-byte type tag:
//!
//! ```text
//! +----------------+----------+-------------------+
//! | Length (2B LE) | Type (1B)| Payload           |
//! +----------------+----------+-------------------+
//! ```
//!
//! Strings are NUL-terminated UTF-8. Addresses are packed in network order
//! (4 bytes IPv4, 16 bytes IPv6). Decoders must consume the payload exactly;
//! trailing bytes make the packet invalid.

pub mod read;
pub mod receive;
pub mod send;
pub mod source;
pub mod write;

/// Upper bound on one UDP payload emitted by this server.
///
/// OpenTTD itself uses a 1460-byte MTU, but experience with the live
/// master server showed that clients behind GREs, VPNs and similar tunnels
/// cannot always receive packets of that size. Lowering by 100 bytes is
/// sufficient for them to query the master server successfully.
pub const SAFE_MTU: usize = 1360;

/// Welcome string a game server has to present when registering.
pub const MASTER_SERVER_WELCOME_MESSAGE: &str = "OpenTTDRegister";

/// Day count from year 0 up to the original TTD base year (1920).
///
/// GameInfo version 3 changed dates to be counted from the year zero; this
/// offset lifts the 16-bit dates of versions 1 and 2 onto the same scale.
pub const DAYS_TILL_ORIGINAL_BASE_YEAR: u32 =
    365 * 1920 + 1920 / 4 - 1920 / 100 + 1920 / 400;

/// UDP packet types, as defined by OpenTTD's `src/network/core/udp.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Queries a game server for game information.
    ClientFindServer = 0,
    /// Reply of the game server with game information.
    ServerResponse = 1,
    /// Queries a game server about details of the game, such as companies.
    ClientDetailInfo = 2,
    /// Reply of the game server about details of the game.
    ServerDetailInfo = 3,
    /// Packet to register itself to the master server.
    ServerRegister = 4,
    /// Packet indicating registration has succeeded.
    MasterAckRegister = 5,
    /// Request for the server list from the master server.
    ClientGetList = 6,
    /// Response from the master server with server IPs and ports.
    MasterResponseList = 7,
    /// Request to be removed from the server list.
    ServerUnregister = 8,
    /// Requests the name for a list of GRFs (GRF id and MD5).
    ClientGetNewgrfs = 9,
    /// Sends the list of NewGRFs requested.
    ServerNewgrfs = 10,
    /// Sends a fresh session key to the client.
    MasterSessionKey = 11,
}

/// One past the highest valid packet type.
pub const PACKET_UDP_END: u8 = 12;

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ClientFindServer),
            1 => Some(Self::ServerResponse),
            2 => Some(Self::ClientDetailInfo),
            3 => Some(Self::ServerDetailInfo),
            4 => Some(Self::ServerRegister),
            5 => Some(Self::MasterAckRegister),
            6 => Some(Self::ClientGetList),
            7 => Some(Self::MasterResponseList),
            8 => Some(Self::ServerUnregister),
            9 => Some(Self::ClientGetNewgrfs),
            10 => Some(Self::ServerNewgrfs),
            11 => Some(Self::MasterSessionKey),
            _ => None,
        }
    }
}

/// Server list type requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerListType {
    Ipv4 = 0,
    Ipv6 = 1,
    Autodetect = 2,
}

impl ServerListType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ipv4),
            1 => Some(Self::Ipv6),
            2 => Some(Self::Autodetect),
            _ => None,
        }
    }

    /// Packed address length in a MASTER_RESPONSE_LIST record.
    pub fn address_len(self) -> usize {
        match self {
            Self::Ipv6 => 16,
            _ => 4,
        }
    }
}

/// Protocol error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared packet length does not match the datagram length.
    InvalidSize { declared: u16, actual: usize },
    /// Packet type out of range or not handled by this server.
    InvalidType(u8),
    /// Payload inconsistency (short read, trailing bytes, bad field).
    InvalidData(&'static str),
    /// Encoded packet would exceed [`SAFE_MTU`].
    TooBig(usize),
    /// PROXY protocol required but the datagram carried no header and no
    /// flow mapping exists for its socket address.
    NoProxyHeader,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize { declared, actual } => {
                write!(f, "invalid packet size: declared {}, got {}", declared, actual)
            }
            Self::InvalidType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidData(s) => write!(f, "invalid packet data: {}", s),
            Self::TooBig(len) => {
                write!(f, "packet too big: {} > {} bytes", len, SAFE_MTU)
            }
            Self::NoProxyHeader => write!(f, "datagram without PROXY protocol header"),
        }
    }
}

impl std::error::Error for ProtocolError {}
