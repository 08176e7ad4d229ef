// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound packet decoding.
//!
//! Only the four packet types a master server handles decode to a
//! [`Packet`]; everything else in range is rejected as an invalid type,
//! just like types past the end of the enum.

use super::read::Reader;
use super::{
    PacketType, ProtocolError, ServerListType, DAYS_TILL_ORIGINAL_BASE_YEAR,
    MASTER_SERVER_WELCOME_MESSAGE, PACKET_UDP_END,
};
use crate::storage::{GameInfo, NewGrf};
use std::net::IpAddr;

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Client asks for the server list. Autodetect is already resolved
    /// against the source address; `slt` is IPv4 or IPv6 here.
    ClientGetList { slt: ServerListType },
    /// Game server announces itself. `session_key` is `None` for the v1
    /// registration packet.
    ServerRegister { port: u16, session_key: Option<u64> },
    /// Game server replies to CLIENT_FIND_SERVER with its game info.
    ServerResponse { info: GameInfo },
    /// Game server asks to be removed from the list.
    ServerUnregister { port: u16 },
}

/// Whether an address counts as IPv6 for list purposes; v4-mapped IPv6
/// addresses count as IPv4.
pub fn is_ipv6(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_none(),
    }
}

/// Decode one datagram into a typed packet.
///
/// `source_ip` is the effective source address (after any PROXY unwrap);
/// it only participates in SLT autodetection.
pub fn decode_packet(source_ip: IpAddr, data: &[u8]) -> Result<Packet, ProtocolError> {
    let mut r = Reader::new(data);

    let length = r.read_u16()?;
    if length as usize != data.len() {
        return Err(ProtocolError::InvalidSize {
            declared: length,
            actual: data.len(),
        });
    }

    let raw_type = r.read_u8()?;
    if raw_type >= PACKET_UDP_END {
        return Err(ProtocolError::InvalidType(raw_type));
    }

    match PacketType::from_u8(raw_type) {
        Some(PacketType::ClientGetList) => decode_client_get_list(source_ip, r),
        Some(PacketType::ServerRegister) => decode_server_register(r),
        Some(PacketType::ServerResponse) => decode_server_response(r),
        Some(PacketType::ServerUnregister) => decode_server_unregister(r),
        _ => Err(ProtocolError::InvalidType(raw_type)),
    }
}

fn decode_client_get_list(source_ip: IpAddr, mut r: Reader<'_>) -> Result<Packet, ProtocolError> {
    let version = r.read_u8()?;
    let raw_slt = if version == 2 {
        r.read_u8()?
    } else {
        ServerListType::Ipv4 as u8
    };
    r.expect_end()?;

    if !(1..=2).contains(&version) {
        return Err(ProtocolError::InvalidData("wrong version"));
    }
    let slt = ServerListType::from_u8(raw_slt)
        .ok_or(ProtocolError::InvalidData("invalid server list type"))?;

    let slt = match slt {
        ServerListType::Autodetect if is_ipv6(source_ip) => ServerListType::Ipv6,
        ServerListType::Autodetect => ServerListType::Ipv4,
        other => other,
    };

    Ok(Packet::ClientGetList { slt })
}

fn decode_server_register(mut r: Reader<'_>) -> Result<Packet, ProtocolError> {
    let welcome = r.read_string()?;
    let version = r.read_u8()?;
    let port = r.read_u16()?;
    let session_key = if version == 2 { Some(r.read_u64()?) } else { None };
    r.expect_end()?;

    if welcome != MASTER_SERVER_WELCOME_MESSAGE {
        return Err(ProtocolError::InvalidData("wrong welcome message"));
    }
    if !(1..=2).contains(&version) {
        return Err(ProtocolError::InvalidData("wrong version"));
    }

    Ok(Packet::ServerRegister { port, session_key })
}

fn decode_server_unregister(mut r: Reader<'_>) -> Result<Packet, ProtocolError> {
    let version = r.read_u8()?;
    let port = r.read_u16()?;
    r.expect_end()?;

    if !(1..=2).contains(&version) {
        return Err(ProtocolError::InvalidData("wrong version"));
    }

    Ok(Packet::ServerUnregister { port })
}

fn decode_server_response(mut r: Reader<'_>) -> Result<Packet, ProtocolError> {
    let version = r.read_u8()?;
    if !(1..=4).contains(&version) {
        return Err(ProtocolError::InvalidData("unsupported game info version"));
    }

    let mut newgrfs = Vec::new();
    if version >= 4 {
        let num_grfs = r.read_u8()?;
        for _ in 0..num_grfs {
            let grfid = r.read_u32()?;
            let mut md5sum = [0u8; 16];
            md5sum.copy_from_slice(r.read_bytes(16)?);
            newgrfs.push(NewGrf { grfid, md5sum });
        }
    }

    let mut game_date = 0;
    let mut start_date = 0;
    if version >= 3 {
        game_date = r.read_u32()?;
        start_date = r.read_u32()?;
    }

    let (mut companies_max, mut companies_on, mut spectators_max) = (0, 0, 0);
    if version >= 2 {
        companies_max = r.read_u8()?;
        companies_on = r.read_u8()?;
        spectators_max = r.read_u8()?;
    }

    let name = r.read_string()?;
    let openttd_version = r.read_string()?;
    let language = r.read_u8()?;
    let use_password = r.read_u8()?;
    let clients_max = r.read_u8()?;
    let clients_on = r.read_u8()?;
    let spectators_on = r.read_u8()?;
    if version < 3 {
        // Old-style dates count from 1920; lift them onto the year-zero scale.
        game_date = u32::from(r.read_u16()?) + DAYS_TILL_ORIGINAL_BASE_YEAR;
        start_date = u32::from(r.read_u16()?) + DAYS_TILL_ORIGINAL_BASE_YEAR;
    }
    let map_name = r.read_string()?;
    let map_width = r.read_u16()?;
    let map_height = r.read_u16()?;
    let map_type = r.read_u8()?;
    let is_dedicated = r.read_u8()?;
    r.expect_end()?;

    Ok(Packet::ServerResponse {
        info: GameInfo {
            newgrfs,
            game_date,
            start_date,
            companies_max,
            companies_on,
            spectators_max,
            name,
            openttd_version,
            language,
            use_password,
            clients_max,
            clients_on,
            spectators_on,
            map_name,
            map_width,
            map_height,
            map_type,
            is_dedicated,
        },
    })
}
