// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master server role: the registration state machine.
//!
//! Registration is a three-way handshake layered on UDP. A REGISTER only
//! announces a server; the master then probes the announced port itself,
//! and only a SERVER_RESPONSE from that port commits the server to the
//! registry and triggers the ACK. The ACK goes back to the socket address
//! the REGISTER came from, which is an ephemeral port on the game server,
//! not its game port:
//!
//! ```text
//! server (random port)  --- SERVER_REGISTER(port P) --->  master
//! server (game port P)  <-- CLIENT_FIND_SERVER ---------  master
//! server (game port P)  --- SERVER_RESPONSE(info) ----->  master
//! server (random port)  <-- MASTER_ACK_REGISTER --------  master
//! ```
//!
//! A server that never sees the ACK retries its REGISTER on its own; the
//! master keeps no retransmit state for the ACK itself.

use crate::config::MasterConfig;
use crate::protocol::receive::Packet;
use crate::protocol::send;
use crate::protocol::source::Source;
use crate::protocol::ServerListType;
use crate::query::{QueryPurpose, QueryTracker};
use crate::session::SessionKeyManager;
use crate::storage::{GameInfo, Registry, ServerAddr};
use crate::udp::PacketHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct CachedList {
    servers: Vec<ServerAddr>,
    expires: Instant,
}

pub struct MasterApp {
    registry: Arc<dyn Registry>,
    sessions: SessionKeyManager,
    queries: Arc<QueryTracker>,
    list_cache: Mutex<HashMap<ServerListType, CachedList>>,
    list_cache_ttl: Duration,
}

impl MasterApp {
    pub fn new(config: &MasterConfig, registry: Arc<dyn Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions: SessionKeyManager::new(),
            queries: QueryTracker::new(config.query_timeout(), config.query_retries, None),
            list_cache: Mutex::new(HashMap::new()),
            list_cache_ttl: config.list_cache_duration(),
        })
    }

    /// Issue a fresh session key to `addr` and persist its token.
    async fn issue_session_key(&self, source: &Source, addr: SocketAddr) {
        let (session_key, token) = self.sessions.next_key();
        if let Err(err) = self.registry.store_session_key_token(session_key, token) {
            warn!("failed to store session key: {}", err);
            return;
        }

        match send::master_session_key(session_key | u64::from(token)) {
            Ok(data) => {
                if let Err(err) = source.endpoint.send(addr, &data).await {
                    warn!("failed to send session key to {}: {}", addr, err);
                }
            }
            Err(err) => warn!("failed to encode session key: {}", err),
        }
    }

    async fn handle_register(&self, source: Source, port: u16, session_key: Option<u64>) {
        let session_key = match session_key {
            None => {
                // A v1 server cannot carry a session key; derive one from
                // its static address so it still has a stable identity.
                let key = SessionKeyManager::legacy_key(source.ip, port);
                if let Err(err) = self.registry.store_session_key_token(key, 0) {
                    warn!("failed to store legacy session key: {}", err);
                    return;
                }
                key
            }
            Some(0) => {
                // First contact of a v2 server. Hand out a key and wait:
                // the server re-registers with it, and the missing ACK
                // drives its own retry loop in the meantime.
                self.issue_session_key(&source, source.socket_addr).await;
                return;
            }
            Some(presented) => {
                let (key, token) = SessionKeyManager::split_key(presented);
                match self.registry.check_session_key_token(key, token) {
                    Ok(true) => key,
                    Ok(false) => {
                        info!(
                            "invalid session-key token from {}:{}; transmitting new session-key",
                            source.ip, source.port
                        );
                        self.issue_session_key(&source, source.socket_addr).await;
                        return;
                    }
                    Err(err) => {
                        warn!("session-key lookup failed: {}", err);
                        return;
                    }
                }
            }
        };

        // The server should be reachable on the announced port at the
        // address the datagram came from; confirm before listing it. The
        // REGISTER socket address is kept for the ACK.
        self.queries.start_query(
            Arc::clone(&source.endpoint),
            source.ip,
            port,
            QueryPurpose::Register {
                session_key,
                reply_addr: source.socket_addr,
            },
        );
    }

    async fn handle_response(&self, source: Source, info: GameInfo) {
        let Some(purpose) = self.queries.on_response(source.ip, source.port) else {
            info!(
                "response from {}:{}, but we did not expect a response",
                source.ip, source.port
            );
            return;
        };

        let QueryPurpose::Register {
            session_key,
            reply_addr,
        } = purpose
        else {
            debug!("refresh query answered by {}:{}", source.ip, source.port);
            return;
        };

        if !info.is_valid() {
            info!(
                "dropping registration of {}:{}: empty server name or version",
                source.ip, source.port
            );
            return;
        }

        match self
            .registry
            .server_online(session_key, source.ip, source.port, &info)
        {
            Ok(true) => {
                debug!("server {}:{} online as {}", source.ip, source.port, session_key);
                match send::master_ack_register() {
                    Ok(data) => {
                        if let Err(err) = source.endpoint.send(reply_addr, &data).await {
                            warn!("failed to ack registration to {}: {}", reply_addr, err);
                        }
                    }
                    Err(err) => warn!("failed to encode ack: {}", err),
                }
            }
            Ok(false) => info!(
                "registry rejected {}:{} under session key {}",
                source.ip, source.port, session_key
            ),
            Err(err) => warn!("failed to mark server online: {}", err),
        }
    }

    async fn handle_unregister(&self, source: Source, port: u16) {
        if let Err(err) = self.registry.server_offline(source.ip, port) {
            warn!("failed to mark server offline: {}", err);
        }
    }

    async fn handle_get_list(&self, source: Source, slt: ServerListType) {
        let servers = match self.cached_server_list(slt) {
            Ok(servers) => servers,
            Err(err) => {
                warn!("failed to fetch server list: {}", err);
                return;
            }
        };

        // An empty registry still answers, with a zero-count list.
        let max_count = send::response_list_max_count(slt);
        let chunks: Vec<&[ServerAddr]> = if servers.is_empty() {
            vec![&[]]
        } else {
            servers.chunks(max_count).collect()
        };

        for chunk in chunks {
            match send::master_response_list(slt, chunk) {
                Ok(data) => {
                    if let Err(err) = source.endpoint.send(source.socket_addr, &data).await {
                        warn!("failed to send server list to {}: {}", source.socket_addr, err);
                        return;
                    }
                }
                Err(err) => {
                    warn!("failed to encode server list: {}", err);
                    return;
                }
            }
        }
    }

    fn cached_server_list(
        &self,
        slt: ServerListType,
    ) -> Result<Vec<ServerAddr>, crate::storage::RegistryError> {
        if let Some(cached) = self.list_cache.lock().get(&slt) {
            if cached.expires > Instant::now() {
                return Ok(cached.servers.clone());
            }
        }

        let servers = self
            .registry
            .get_server_list_for_client(slt == ServerListType::Ipv6)?;
        self.list_cache.lock().insert(
            slt,
            CachedList {
                servers: servers.clone(),
                expires: Instant::now() + self.list_cache_ttl,
            },
        );
        Ok(servers)
    }
}

impl PacketHandler for MasterApp {
    async fn handle_packet(&self, source: Source, packet: Packet) {
        match packet {
            Packet::ServerRegister { port, session_key } => {
                self.handle_register(source, port, session_key).await;
            }
            Packet::ServerResponse { info } => {
                self.handle_response(source, info).await;
            }
            Packet::ServerUnregister { port } => {
                self.handle_unregister(source, port).await;
            }
            Packet::ClientGetList { slt } => {
                self.handle_get_list(source, slt).await;
            }
        }
    }
}

/// Periodically mark silent servers offline.
///
/// Starts with a random delay so replicas do not sweep in lockstep. A
/// registry failure ends the loop; a broken sweeper must not keep spinning
/// silently, the orchestrator is expected to restart the process.
pub fn spawn_stale_sweeper(
    registry: Arc<dyn Registry>,
    interval: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let jitter = Duration::from_secs(fastrand::u64(0..interval.as_secs().max(1)));
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown.notified() => return,
        }

        loop {
            match registry.sweep_stale() {
                Ok(0) => {}
                Ok(swept) => info!("marked {} stale servers offline", swept),
                Err(err) => {
                    error!("stale sweep failed, stopping sweeper: {}", err);
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.notified() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketType, SAFE_MTU};
    use crate::storage::memory::MemoryRegistry;
    use crate::udp::UdpEndpoint;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    struct TestMaster {
        registry: Arc<dyn Registry>,
        app: Arc<MasterApp>,
        addr: SocketAddr,
        _shutdown: Arc<Notify>,
    }

    async fn start_master() -> TestMaster {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::default());
        let config = MasterConfig {
            query_timeout_secs: 1,
            ..Default::default()
        };
        let app = MasterApp::new(&config, Arc::clone(&registry));
        let endpoint = UdpEndpoint::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false, None)
            .await
            .unwrap();
        let addr = endpoint.local_addr();
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(endpoint.run(Arc::clone(&app), Arc::clone(&shutdown)));
        TestMaster {
            registry,
            app,
            addr,
            _shutdown: shutdown,
        }
    }

    fn finish_packet(mut data: Vec<u8>) -> Vec<u8> {
        let len = data.len() as u16;
        data[0..2].copy_from_slice(&len.to_le_bytes());
        data
    }

    fn register_v1(port: u16) -> Vec<u8> {
        let mut data = vec![0, 0, PacketType::ServerRegister as u8];
        data.extend_from_slice(b"OpenTTDRegister\x00");
        data.push(1);
        data.extend_from_slice(&port.to_le_bytes());
        finish_packet(data)
    }

    fn register_v2(port: u16, session_key: u64) -> Vec<u8> {
        let mut data = vec![0, 0, PacketType::ServerRegister as u8];
        data.extend_from_slice(b"OpenTTDRegister\x00");
        data.push(2);
        data.extend_from_slice(&port.to_le_bytes());
        data.extend_from_slice(&session_key.to_le_bytes());
        finish_packet(data)
    }

    fn response_v4() -> Vec<u8> {
        let mut data = vec![0, 0, PacketType::ServerResponse as u8];
        data.push(4); // game info version
        data.push(1); // one NewGRF
        data.extend_from_slice(&0x4D47_0101u32.to_le_bytes());
        data.extend_from_slice(&[0xAB; 16]);
        data.extend_from_slice(&730_000u32.to_le_bytes()); // game_date
        data.extend_from_slice(&701_265u32.to_le_bytes()); // start_date
        data.push(15); // companies_max
        data.push(2); // companies_on
        data.push(10); // spectators_max
        data.extend_from_slice(b"Test\x00");
        data.extend_from_slice(b"1.11\x00");
        data.push(0x16); // language
        data.push(0); // use_password
        data.push(25); // clients_max
        data.push(3); // clients_on
        data.push(1); // spectators_on
        data.extend_from_slice(b"Random Map\x00");
        data.extend_from_slice(&256u16.to_le_bytes());
        data.extend_from_slice(&256u16.to_le_bytes());
        data.push(1); // map_type
        data.push(1); // is_dedicated
        finish_packet(data)
    }

    fn unregister(port: u16) -> Vec<u8> {
        let mut data = vec![0, 0, PacketType::ServerUnregister as u8];
        data.push(1);
        data.extend_from_slice(&port.to_le_bytes());
        finish_packet(data)
    }

    fn get_list_v1() -> Vec<u8> {
        finish_packet(vec![0, 0, PacketType::ClientGetList as u8, 1])
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; SAFE_MTU];
        let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a packet")
            .unwrap();
        buf.truncate(len);
        buf
    }

    #[tokio::test]
    async fn test_v1_register_probe_response_ack() {
        let master = start_master().await;
        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game_port = game.local_addr().unwrap().port();

        game.send_to(&register_v1(game_port), master.addr).await.unwrap();

        // The master probes the announced port; no session key is issued.
        let probe = recv(&game).await;
        assert_eq!(probe, vec![0x03, 0x00, 0x00]);

        game.send_to(&response_v4(), master.addr).await.unwrap();

        // The ACK arrives at the socket the REGISTER was sent from.
        let ack = recv(&game).await;
        assert_eq!(ack, vec![0x03, 0x00, 0x05]);

        let list = master.registry.get_server_list_for_client(false).unwrap();
        assert_eq!(
            list,
            vec![ServerAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), game_port)]
        );
        let web = master.registry.get_server_list_for_web().unwrap();
        assert_eq!(web[0].info.as_ref().unwrap().name, "Test");
        assert_eq!(web[0].info.as_ref().unwrap().newgrfs.len(), 1);
    }

    #[tokio::test]
    async fn test_v2_handshake_issues_key_then_acks() {
        let master = start_master().await;
        // Separate sockets for the ephemeral REGISTER source and the game
        // port, to pin down where each reply has to arrive.
        let register_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game_port = game.local_addr().unwrap().port();

        // Initial contact with session key 0: a key comes back, no probe.
        register_socket
            .send_to(&register_v2(game_port, 0), master.addr)
            .await
            .unwrap();
        let reply = recv(&register_socket).await;
        assert_eq!(reply[2], PacketType::MasterSessionKey as u8);
        assert_eq!(reply.len(), 11);
        let issued = u64::from_le_bytes(reply[3..11].try_into().unwrap());
        assert!(issued >= 1 << 44);
        assert_eq!(master.app.queries.pending_count(), 0);

        // Re-register with the issued key: now the probe fires.
        register_socket
            .send_to(&register_v2(game_port, issued), master.addr)
            .await
            .unwrap();
        let probe = recv(&game).await;
        assert_eq!(probe, vec![0x03, 0x00, 0x00]);

        // The game port answers; the ACK goes to the REGISTER socket.
        game.send_to(&response_v4(), master.addr).await.unwrap();
        let ack = recv(&register_socket).await;
        assert_eq!(ack, vec![0x03, 0x00, 0x05]);

        let list = master.registry.get_server_list_for_client(false).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].port, game_port);
    }

    #[tokio::test]
    async fn test_bad_token_reissues_key() {
        let master = start_master().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        socket.send_to(&register_v2(4000, 0), master.addr).await.unwrap();
        let reply = recv(&socket).await;
        let issued = u64::from_le_bytes(reply[3..11].try_into().unwrap());

        // Corrupt the token byte: instead of a probe we get a fresh key.
        socket
            .send_to(&register_v2(4000, issued ^ 0x01), master.addr)
            .await
            .unwrap();
        let reply = recv(&socket).await;
        assert_eq!(reply[2], PacketType::MasterSessionKey as u8);
        let reissued = u64::from_le_bytes(reply[3..11].try_into().unwrap());
        assert_ne!(reissued & !0xFF, issued & !0xFF);
        assert_eq!(master.app.queries.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_dropped() {
        let master = start_master().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        socket.send_to(&response_v4(), master.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(master.registry.get_server_list_for_web().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_marks_offline() {
        let master = start_master().await;
        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game_port = game.local_addr().unwrap().port();

        game.send_to(&register_v1(game_port), master.addr).await.unwrap();
        recv(&game).await; // probe
        game.send_to(&response_v4(), master.addr).await.unwrap();
        recv(&game).await; // ack

        game.send_to(&unregister(game_port), master.addr).await.unwrap();
        // UNREGISTER has no reply; wait for the handler to run.
        for _ in 0..20 {
            if master.registry.get_server_list_for_client(false).unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server was not marked offline");
    }

    #[tokio::test]
    async fn test_get_list_empty_registry_answers() {
        let master = start_master().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(&get_list_v1(), master.addr).await.unwrap();
        let reply = recv(&client).await;
        assert_eq!(reply[2], PacketType::MasterResponseList as u8);
        assert_eq!(reply[3], ServerListType::Ipv4 as u8 + 1);
        assert_eq!(u16::from_le_bytes([reply[4], reply[5]]), 0);
    }

    #[tokio::test]
    async fn test_get_list_returns_registered_server() {
        let master = start_master().await;
        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let game_port = game.local_addr().unwrap().port();

        game.send_to(&register_v1(game_port), master.addr).await.unwrap();
        recv(&game).await;
        game.send_to(&response_v4(), master.addr).await.unwrap();
        recv(&game).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&get_list_v1(), master.addr).await.unwrap();
        let reply = recv(&client).await;
        assert!(reply.len() <= SAFE_MTU);
        assert_eq!(u16::from_le_bytes([reply[4], reply[5]]), 1);
        assert_eq!(&reply[6..10], &[127, 0, 0, 1]);
        assert_eq!(u16::from_le_bytes([reply[10], reply[11]]), game_port);
    }

    #[tokio::test]
    async fn test_get_list_fragments_large_registry() {
        let master = start_master().await;
        // One more server than fits a single fragment.
        for i in 0..226u32 {
            let key = (1u64 << 50) + u64::from(i);
            let ip = IpAddr::V4(Ipv4Addr::new(10, 1, (i >> 8) as u8, i as u8));
            master.registry.store_session_key_token(key, 0).unwrap();
            master
                .registry
                .server_online(key, ip, 3979, &crate::storage::sample_game_info())
                .unwrap();
        }

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&get_list_v1(), master.addr).await.unwrap();

        let first = recv(&client).await;
        let second = recv(&client).await;
        assert!(first.len() <= SAFE_MTU && second.len() <= SAFE_MTU);
        let count = |p: &[u8]| u16::from_le_bytes([p[4], p[5]]);
        assert_eq!(count(&first) + count(&second), 226);
        assert_eq!(count(&first).max(count(&second)), 225);
    }

    #[tokio::test]
    async fn test_list_cache_masks_registry_changes() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::default());
        let config = MasterConfig::default();
        let app = MasterApp::new(&config, Arc::clone(&registry));

        let first = app.cached_server_list(ServerListType::Ipv4).unwrap();
        assert!(first.is_empty());

        registry.store_session_key_token(42 << 44, 0).unwrap();
        registry
            .server_online(
                42 << 44,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                3979,
                &crate::storage::sample_game_info(),
            )
            .unwrap();

        // Within the cache window the earlier answer sticks.
        let second = app.cached_server_list(ServerListType::Ipv4).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_error() {
        struct FailingRegistry;
        impl Registry for FailingRegistry {
            fn store_session_key_token(&self, _: u64, _: u8) -> Result<(), crate::storage::RegistryError> {
                Ok(())
            }
            fn check_session_key_token(&self, _: u64, _: u8) -> Result<bool, crate::storage::RegistryError> {
                Ok(false)
            }
            fn server_online(
                &self,
                _: u64,
                _: IpAddr,
                _: u16,
                _: &GameInfo,
            ) -> Result<bool, crate::storage::RegistryError> {
                Ok(false)
            }
            fn server_offline(&self, _: IpAddr, _: u16) -> Result<(), crate::storage::RegistryError> {
                Ok(())
            }
            fn get_server_list_for_client(
                &self,
                _: bool,
            ) -> Result<Vec<ServerAddr>, crate::storage::RegistryError> {
                Ok(Vec::new())
            }
            fn get_server_info_for_web(
                &self,
                _: &str,
            ) -> Result<Option<crate::storage::ServerDetail>, crate::storage::RegistryError> {
                Ok(None)
            }
            fn get_server_list_for_web(
                &self,
            ) -> Result<Vec<crate::storage::ServerDetail>, crate::storage::RegistryError> {
                Ok(Vec::new())
            }
            fn sweep_stale(&self) -> Result<usize, crate::storage::RegistryError> {
                Err(crate::storage::RegistryError::Backend("boom".into()))
            }
        }

        let shutdown = Arc::new(Notify::new());
        let handle = spawn_stale_sweeper(
            Arc::new(FailingRegistry),
            Duration::from_secs(1),
            shutdown,
        );
        // The first failing sweep ends the task (jitter is under a second).
        timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    }
}
