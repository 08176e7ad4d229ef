// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry interface and data model.
//!
//! The registry persists which game servers are online. A logical server is
//! addressed by its 64-bit session key and may be reachable over several
//! `(ip, port)` combinations; each combination gets a secondary binding
//! keyed by its `server_id` (the MD5 of the canonical address string), which
//! is also the surrogate key used by the HTTP read path.

pub mod memory;

use serde::{Serialize, Serializer};
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// After 20 minutes with no advertisement, servers are considered stale.
pub const STALE_SERVER_TIMEOUT: Duration = Duration::from_secs(60 * 20);

/// Current wallclock as whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A bare `(ip, port)` pair, as served to game clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// Surrogate key for one `(ip, port)` combination: the lowercase-hex MD5 of
/// `"ip:port"` for IPv4 or `"[ip]:port"` for IPv6.
pub fn server_id(ip: IpAddr, port: u16) -> String {
    use md5::{Digest, Md5};

    let canonical = match ip {
        IpAddr::V4(_) => format!("{}:{}", ip, port),
        IpAddr::V6(_) => format!("[{}]:{}", ip, port),
    };
    hex_encode(&Md5::digest(canonical.as_bytes()))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn serialize_md5sum<S: Serializer>(md5sum: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex_encode(md5sum))
}

/// A NewGRF reference: 4-byte GRF id plus 16-byte MD5 digest. Opaque to the
/// master server; only recorded and served back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NewGrf {
    pub grfid: u32,
    #[serde(serialize_with = "serialize_md5sum")]
    pub md5sum: [u8; 16],
}

/// Decoded game-server metadata, as carried by SERVER_RESPONSE.
///
/// Fields absent from older GameInfo versions decode as zero / empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameInfo {
    pub newgrfs: Vec<NewGrf>,
    pub game_date: u32,
    pub start_date: u32,
    pub companies_max: u8,
    pub companies_on: u8,
    pub spectators_max: u8,
    pub name: String,
    pub openttd_version: String,
    pub language: u8,
    pub use_password: u8,
    pub clients_max: u8,
    pub clients_on: u8,
    pub spectators_on: u8,
    pub map_name: String,
    pub map_width: u16,
    pub map_height: u16,
    pub map_type: u8,
    pub is_dedicated: u8,
}

impl GameInfo {
    /// A registration without a server name or version is meaningless and
    /// gets dropped.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.openttd_version.is_empty()
    }
}

/// One `(ip, port)` combination of a server, as served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDetail {
    pub ip: String,
    pub port: u16,
    pub server_id: String,
}

impl EndpointDetail {
    pub fn from_addr(addr: ServerAddr) -> Self {
        Self {
            ip: addr.ip.to_string(),
            port: addr.port,
            server_id: server_id(addr.ip, addr.port),
        }
    }
}

/// Full server record for the HTTP read path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerDetail {
    pub info: Option<GameInfo>,
    pub first_seen: Option<u64>,
    pub last_seen: Option<u64>,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<EndpointDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<EndpointDetail>,
}

/// Registry backend error.
#[derive(Debug, Clone)]
pub enum RegistryError {
    Backend(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(s) => write!(f, "registry backend error: {}", s),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Persistent registry of game servers.
///
/// Implementations may block on I/O; mutations must be linearizable per
/// key. The in-memory reference implementation is [`memory::MemoryRegistry`].
pub trait Registry: Send + Sync {
    /// Store a freshly issued session key with its token.
    ///
    /// An existing key must not be re-bound to a different token; the loser
    /// of such a race simply fails the next token check and is reissued.
    fn store_session_key_token(&self, session_key: u64, token: u8) -> Result<(), RegistryError>;

    /// Check whether this session key exists and carries this token.
    fn check_session_key_token(&self, session_key: u64, token: u8) -> Result<bool, RegistryError>;

    /// Mark the server behind `session_key` online at `(ip, port)`.
    ///
    /// Returns `false` if the update is rejected (unknown session key or
    /// invalid info). If `(ip, port)` is currently bound to a different
    /// session key, that server is marked offline first; the new key tracks
    /// the address from now on.
    fn server_online(
        &self,
        session_key: u64,
        ip: IpAddr,
        port: u16,
        info: &GameInfo,
    ) -> Result<bool, RegistryError>;

    /// Mark the server at `(ip, port)` offline. Unknown addresses are a
    /// no-op, which also makes repeated UNREGISTERs idempotent.
    fn server_offline(&self, ip: IpAddr, port: u16) -> Result<(), RegistryError>;

    /// Online `(ip, port)` pairs of the requested address family.
    fn get_server_list_for_client(&self, ipv6: bool) -> Result<Vec<ServerAddr>, RegistryError>;

    /// Details for a single server, addressed by `server_id`.
    fn get_server_info_for_web(
        &self,
        server_id: &str,
    ) -> Result<Option<ServerDetail>, RegistryError>;

    /// Details for every online server.
    fn get_server_list_for_web(&self) -> Result<Vec<ServerDetail>, RegistryError>;

    /// Mark every server that has not advertised within
    /// [`STALE_SERVER_TIMEOUT`] offline; returns how many were affected.
    fn sweep_stale(&self) -> Result<usize, RegistryError>;
}

#[cfg(test)]
pub(crate) fn sample_game_info() -> GameInfo {
    GameInfo {
        newgrfs: Vec::new(),
        game_date: 730_000,
        start_date: 701_265,
        companies_max: 15,
        companies_on: 2,
        spectators_max: 10,
        name: "Test".into(),
        openttd_version: "1.11".into(),
        language: 0,
        use_password: 0,
        clients_max: 25,
        clients_on: 3,
        spectators_on: 1,
        map_name: "Random Map".into(),
        map_width: 256,
        map_height: 256,
        map_type: 1,
        is_dedicated: 1,
    }
}
