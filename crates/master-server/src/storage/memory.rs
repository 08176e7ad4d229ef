// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory reference implementation of the [`Registry`] trait.
//!
//! Two maps carry the state: session key to server entry, and `server_id`
//! to the `(ip, port)` binding pointing back at the owning session key.
//! Nothing expires by itself; [`sweep_stale`](Registry::sweep_stale) marks
//! silent servers offline.

use super::{
    server_id, unix_now, EndpointDetail, GameInfo, Registry, RegistryError, ServerAddr,
    ServerDetail, STALE_SERVER_TIMEOUT,
};
use crate::protocol::receive::is_ipv6;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// One logical server, addressed by its session key.
#[derive(Debug, Default)]
struct ServerEntry {
    token: u8,
    online: bool,
    ipv4: Option<ServerAddr>,
    ipv6: Option<ServerAddr>,
    info: Option<GameInfo>,
    first_seen: Option<u64>,
    last_seen: Option<u64>,
}

impl ServerEntry {
    fn to_detail(&self) -> ServerDetail {
        ServerDetail {
            info: self.info.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            online: self.online,
            ipv4: self.ipv4.map(EndpointDetail::from_addr),
            ipv6: self.ipv6.map(EndpointDetail::from_addr),
        }
    }
}

/// Secondary index entry: one `(ip, port)` combination of a server.
#[derive(Debug)]
struct IpPortBinding {
    session_key: u64,
    addr: ServerAddr,
    online: bool,
    last_seen: u64,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<u64, ServerEntry>,
    bindings: HashMap<String, IpPortBinding>,
}

pub struct MemoryRegistry {
    inner: Mutex<Inner>,
    stale_after: Duration,
}

impl MemoryRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stale_after,
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(STALE_SERVER_TIMEOUT)
    }
}

impl Registry for MemoryRegistry {
    fn store_session_key_token(&self, session_key: u64, token: u8) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.servers.get(&session_key) {
            if entry.token != token {
                // Another issuer got here first; the loser fails its next
                // token check and gets reissued.
                debug!(session_key, "refusing to re-bind session key to a new token");
            }
            return Ok(());
        }
        inner.servers.insert(
            session_key,
            ServerEntry {
                token,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn check_session_key_token(&self, session_key: u64, token: u8) -> Result<bool, RegistryError> {
        let inner = self.inner.lock();
        Ok(inner
            .servers
            .get(&session_key)
            .is_some_and(|entry| entry.token == token))
    }

    fn server_online(
        &self,
        session_key: u64,
        ip: IpAddr,
        port: u16,
        info: &GameInfo,
    ) -> Result<bool, RegistryError> {
        if !info.is_valid() {
            return Ok(false);
        }

        let sid = server_id(ip, port);
        let mut inner = self.inner.lock();

        // An address already bound under another session key means that
        // server never unregistered itself (crash, most likely). The old
        // entry goes offline; the new key tracks this address from now on.
        if let Some(binding) = inner.bindings.get(&sid) {
            if binding.session_key != session_key {
                let old_key = binding.session_key;
                info!(ip = %ip, port, old_key, "address re-registered under a new session key");
                if let Some(old) = inner.servers.get_mut(&old_key) {
                    old.online = false;
                }
            }
        }

        let Some(entry) = inner.servers.get_mut(&session_key) else {
            return Ok(false);
        };

        let now = unix_now();
        let addr = ServerAddr::new(ip, port);
        entry.online = true;
        entry.info = Some(info.clone());
        entry.last_seen = Some(now);
        if entry.first_seen.is_none() {
            entry.first_seen = Some(now);
        }
        if is_ipv6(ip) {
            entry.ipv6 = Some(addr);
        } else {
            entry.ipv4 = Some(addr);
        }

        inner.bindings.insert(
            sid,
            IpPortBinding {
                session_key,
                addr,
                online: true,
                last_seen: now,
            },
        );

        Ok(true)
    }

    fn server_offline(&self, ip: IpAddr, port: u16) -> Result<(), RegistryError> {
        let sid = server_id(ip, port);
        let mut inner = self.inner.lock();
        let now = unix_now();

        let Some(binding) = inner.bindings.get_mut(&sid) else {
            return Ok(());
        };
        binding.online = false;
        binding.last_seen = now;
        let session_key = binding.session_key;

        if let Some(entry) = inner.servers.get_mut(&session_key) {
            entry.online = false;
            entry.last_seen = Some(now);
        }

        Ok(())
    }

    fn get_server_list_for_client(&self, ipv6: bool) -> Result<Vec<ServerAddr>, RegistryError> {
        let inner = self.inner.lock();
        Ok(inner
            .bindings
            .values()
            .filter(|b| b.online && is_ipv6(b.addr.ip) == ipv6)
            .map(|b| b.addr)
            .collect())
    }

    fn get_server_info_for_web(
        &self,
        server_id: &str,
    ) -> Result<Option<ServerDetail>, RegistryError> {
        let inner = self.inner.lock();
        let Some(binding) = inner.bindings.get(server_id) else {
            return Ok(None);
        };
        Ok(inner
            .servers
            .get(&binding.session_key)
            .map(ServerEntry::to_detail))
    }

    fn get_server_list_for_web(&self) -> Result<Vec<ServerDetail>, RegistryError> {
        let inner = self.inner.lock();
        Ok(inner
            .servers
            .values()
            .filter(|entry| entry.online)
            .map(ServerEntry::to_detail)
            .collect())
    }

    fn sweep_stale(&self) -> Result<usize, RegistryError> {
        let threshold = unix_now().saturating_sub(self.stale_after.as_secs());
        let mut inner = self.inner.lock();

        let mut swept = 0;
        for entry in inner.servers.values_mut() {
            if entry.online && entry.last_seen.is_some_and(|seen| seen < threshold) {
                entry.online = false;
                swept += 1;
            }
        }
        for binding in inner.bindings.values_mut() {
            if binding.online && binding.last_seen < threshold {
                binding.online = false;
            }
        }

        Ok(swept)
    }
}
