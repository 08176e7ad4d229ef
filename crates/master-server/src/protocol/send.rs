// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound packet constructors.

use super::write::PacketWriter;
use super::{PacketType, ProtocolError, ServerListType, SAFE_MTU};
use crate::storage::ServerAddr;
use std::net::IpAddr;

/// CLIENT_FIND_SERVER probe, sent to an announced game server.
pub fn client_find_server() -> Result<Vec<u8>, ProtocolError> {
    PacketWriter::new(PacketType::ClientFindServer).finish()
}

/// MASTER_ACK_REGISTER, confirming a completed registration.
pub fn master_ack_register() -> Result<Vec<u8>, ProtocolError> {
    PacketWriter::new(PacketType::MasterAckRegister).finish()
}

/// MASTER_SESSION_KEY carrying the issued key, token byte included.
pub fn master_session_key(session_key: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut w = PacketWriter::new(PacketType::MasterSessionKey);
    w.write_u64(session_key);
    w.finish()
}

/// Record count that keeps one MASTER_RESPONSE_LIST within [`SAFE_MTU`]:
/// the fixed overhead is length (2) + type (1) + slt (1) + count (2).
pub fn response_list_max_count(slt: ServerListType) -> usize {
    (SAFE_MTU - 2 - 1 - 1 - 2) / (slt.address_len() + 2)
}

/// One MASTER_RESPONSE_LIST fragment. The caller pre-fragments with
/// [`response_list_max_count`]; an oversized chunk fails with
/// [`ProtocolError::TooBig`].
pub fn master_response_list(
    slt: ServerListType,
    servers: &[ServerAddr],
) -> Result<Vec<u8>, ProtocolError> {
    let mut w = PacketWriter::new(PacketType::MasterResponseList);
    w.write_u8(slt as u8 + 1);
    w.write_u16(servers.len() as u16);
    for server in servers {
        match server.ip {
            IpAddr::V4(v4) => w.write_bytes(&v4.octets()),
            IpAddr::V6(v6) => w.write_bytes(&v6.octets()),
        }
        w.write_u16(server.port);
    }
    w.finish()
}
