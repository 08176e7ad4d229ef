// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound packet builder.
//!
//! A packet is built by appending payload bytes after a placeholder length
//! prefix; [`PacketWriter::finish`] rewrites the prefix with the final
//! length and enforces [`SAFE_MTU`](super::SAFE_MTU).

use super::{PacketType, ProtocolError, SAFE_MTU};

pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new(ptype: PacketType) -> Self {
        Self {
            buf: vec![0x00, 0x00, ptype as u8],
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a NUL-terminated string.
    pub fn write_string(&mut self, value: &str) {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0x00);
    }

    /// Rewrite the length prefix and hand out the wire bytes.
    ///
    /// The caller must keep packets within [`SAFE_MTU`](super::SAFE_MTU) by
    /// pre-fragmenting; an oversized packet is an encoding error here, not
    /// something this layer can repair.
    pub fn finish(mut self) -> Result<Vec<u8>, ProtocolError> {
        if self.buf.len() > SAFE_MTU {
            return Err(ProtocolError::TooBig(self.buf.len()));
        }
        let length = self.buf.len() as u16;
        self.buf[0..2].copy_from_slice(&length.to_le_bytes());
        Ok(self.buf)
    }
}
