// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Updater role: periodic liveness re-queries.
//!
//! Walks every online server in the registry and probes it through the
//! same query tracker the master role uses. A server that answers just has
//! its pending query cancelled; one that exhausts its retries is marked
//! offline. Info refreshes stay with the master role.

use crate::config::MasterConfig;
use crate::protocol::receive::{is_ipv6, Packet};
use crate::protocol::source::Source;
use crate::query::{QueryPurpose, QueryTracker};
use crate::storage::Registry;
use crate::udp::{PacketHandler, UdpEndpoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct UpdaterApp {
    registry: Arc<dyn Registry>,
    queries: Arc<QueryTracker>,
}

impl UpdaterApp {
    pub fn new(config: &MasterConfig, registry: Arc<dyn Registry>) -> Arc<Self> {
        let offline_registry = Arc::clone(&registry);
        let queries = QueryTracker::new(
            config.query_timeout(),
            config.query_retries,
            Some(Arc::new(move |ip, port| {
                info!("server {}:{} stopped answering; marking offline", ip, port);
                if let Err(err) = offline_registry.server_offline(ip, port) {
                    warn!("failed to mark server offline: {}", err);
                }
            })),
        );
        Arc::new(Self { registry, queries })
    }

    /// Probe every online server once, on endpoints matching its family.
    async fn requery_round(&self, endpoints: &[Arc<UdpEndpoint>]) {
        for ipv6 in [false, true] {
            let servers = match self.registry.get_server_list_for_client(ipv6) {
                Ok(servers) => servers,
                Err(err) => {
                    warn!("failed to fetch server list for re-query: {}", err);
                    return;
                }
            };
            for server in servers {
                let Some(endpoint) = endpoints
                    .iter()
                    .find(|e| e.is_ipv6() == is_ipv6(server.ip))
                else {
                    debug!(
                        "no endpoint with matching address family for {}:{}",
                        server.ip, server.port
                    );
                    continue;
                };
                self.queries.start_query(
                    Arc::clone(endpoint),
                    server.ip,
                    server.port,
                    QueryPurpose::Refresh,
                );
            }
        }
    }

    /// Re-query loop; the same jitter idiom as the stale sweeper.
    pub fn spawn_requery(
        self: &Arc<Self>,
        endpoints: Vec<Arc<UdpEndpoint>>,
        interval: Duration,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let jitter = Duration::from_secs(fastrand::u64(0..interval.as_secs().max(1)));
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = shutdown.notified() => return,
            }

            loop {
                app.requery_round(&endpoints).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => return,
                }
            }
        })
    }
}

impl PacketHandler for UpdaterApp {
    async fn handle_packet(&self, source: Source, packet: Packet) {
        match packet {
            Packet::ServerResponse { .. } => {
                if self.queries.on_response(source.ip, source.port).is_none() {
                    info!(
                        "response from {}:{}, but we did not expect a response",
                        source.ip, source.port
                    );
                }
            }
            other => {
                debug!("ignoring {:?} in updater role", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRegistry;
    use crate::storage::sample_game_info;
    use std::net::{IpAddr, Ipv4Addr};

    fn updater_with_server() -> (Arc<UpdaterApp>, Arc<dyn Registry>, IpAddr, u16) {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::default());
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        registry.store_session_key_token(77 << 44, 0).unwrap();
        registry
            .server_online(77 << 44, ip, 4100, &sample_game_info())
            .unwrap();

        let config = MasterConfig {
            query_timeout_secs: 1,
            query_retries: 1,
            ..Default::default()
        };
        let app = UpdaterApp::new(&config, Arc::clone(&registry));
        (app, registry, ip, 4100)
    }

    #[tokio::test]
    async fn test_requery_round_starts_probes() {
        let (app, _registry, _ip, _port) = updater_with_server();
        let endpoint = UdpEndpoint::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false, None)
            .await
            .unwrap();

        app.requery_round(&[endpoint]).await;
        assert_eq!(app.queries.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_requery_skips_unreachable_family() {
        let (app, _registry, _ip, _port) = updater_with_server();
        let endpoint = UdpEndpoint::bind("::1".parse().unwrap(), 0, false, None)
            .await
            .unwrap();

        // Only an IPv6 endpoint available for an IPv4 server: no probe.
        app.requery_round(&[endpoint]).await;
        assert_eq!(app.queries.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_probe_marks_server_offline() {
        let (app, registry, _ip, _port) = updater_with_server();
        let endpoint = UdpEndpoint::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false, None)
            .await
            .unwrap();

        // Nothing listens on the probed port; one 1s retry then offline.
        app.requery_round(&[endpoint]).await;
        for _ in 0..40 {
            if registry.get_server_list_for_client(false).unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("server was not marked offline after probe exhaustion");
    }

    #[tokio::test]
    async fn test_response_cancels_refresh_query() {
        let (app, registry, ip, port) = updater_with_server();
        let endpoint = UdpEndpoint::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false, None)
            .await
            .unwrap();

        app.requery_round(&[endpoint.clone()]).await;
        let source = Source {
            endpoint,
            socket_addr: std::net::SocketAddr::new(ip, port),
            ip,
            port,
        };
        app.handle_packet(
            source,
            Packet::ServerResponse {
                info: sample_game_info(),
            },
        )
        .await;

        assert_eq!(app.queries.pending_count(), 0);
        // The server stays online; a refresh answer does not rewrite info.
        assert_eq!(registry.get_server_list_for_client(false).unwrap().len(), 1);
    }
}
