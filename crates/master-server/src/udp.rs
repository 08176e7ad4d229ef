// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP endpoint: socket binding, datagram demultiplexing and dispatch.
//!
//! One endpoint per configured bind address. Datagrams on an endpoint are
//! handled strictly in arrival order; the handler runs to completion before
//! the next datagram is picked up. Decode and handler failures are logged
//! and dropped, never propagated into the receive loop.

use crate::protocol::receive::{decode_packet, Packet};
use crate::protocol::source::{has_proxy_header, parse_proxy_header, Source};
use crate::protocol::{send, ProtocolError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

const RECV_BUFFER_SIZE: usize = 4096;
const INJECT_QUEUE_SIZE: usize = 64;

/// Receiver side of decoded packets.
///
/// Implemented by the application roles; one invocation per datagram, run
/// on the endpoint's receive loop.
pub trait PacketHandler: Send + Sync + 'static {
    fn handle_packet(&self, source: Source, packet: Packet)
        -> impl Future<Output = ()> + Send;
}

/// Send-path error.
#[derive(Debug)]
pub enum SendError {
    Encode(ProtocolError),
    Io(std::io::Error),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<ProtocolError> for SendError {
    fn from(e: ProtocolError) -> Self {
        Self::Encode(e)
    }
}

impl From<std::io::Error> for SendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    is_ipv6: bool,
    proxy_protocol: bool,
    socks_url: Option<String>,
    /// Real client addresses learned from PROXY headers, for front-ends
    /// that only prepend the header to the first datagram of a flow.
    proxy_flows: Mutex<HashMap<SocketAddr, (IpAddr, u16)>>,
    inject_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    inject_rx: Mutex<Option<mpsc::Receiver<(Vec<u8>, SocketAddr)>>>,
}

impl UdpEndpoint {
    pub async fn bind(
        addr: IpAddr,
        port: u16,
        proxy_protocol: bool,
        socks_url: Option<String>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(SocketAddr::new(addr, port)).await?;
        let local_addr = socket.local_addr()?;
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_QUEUE_SIZE);

        Ok(Arc::new(Self {
            socket,
            local_addr,
            is_ipv6: local_addr.is_ipv6(),
            proxy_protocol,
            socks_url,
            proxy_flows: Mutex::new(HashMap::new()),
            inject_tx,
            inject_rx: Mutex::new(Some(inject_rx)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_ipv6(&self) -> bool {
        self.is_ipv6
    }

    pub fn socks_url(&self) -> Option<String> {
        self.socks_url.clone()
    }

    /// Receive loop. Runs until shutdown is signalled.
    pub async fn run<H: PacketHandler>(
        self: Arc<Self>,
        handler: Arc<H>,
        shutdown: Arc<Notify>,
    ) {
        let Some(mut inject_rx) = self.inject_rx.lock().take() else {
            error!("endpoint {} receive loop started twice", self.local_addr);
            return;
        };

        info!("listening on udp {}", self.local_addr);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, peer)) => {
                        self.process_datagram(&buf[..len], peer, false, &handler).await;
                    }
                    Err(err) => {
                        error!("receive error on {}: {}", self.local_addr, err);
                    }
                },
                Some((data, peer)) = inject_rx.recv() => {
                    self.process_datagram(&data, peer, true, &handler).await;
                }
                _ = shutdown.notified() => {
                    info!("endpoint {} shutting down", self.local_addr);
                    return;
                }
            }
        }
    }

    /// Feed a datagram into the pipeline as if received from `peer`. Used
    /// for replies arriving through the SOCKS relay; these skip the PROXY
    /// demux.
    pub async fn inject_datagram(&self, data: Vec<u8>, peer: SocketAddr) {
        if self.inject_tx.send((data, peer)).await.is_err() {
            warn!("endpoint {} is gone; dropping injected datagram", self.local_addr);
        }
    }

    async fn process_datagram<H: PacketHandler>(
        self: &Arc<Self>,
        data: &[u8],
        peer: SocketAddr,
        from_relay: bool,
        handler: &Arc<H>,
    ) {
        let (ip, port, payload) = match self.resolve_source(data, peer, from_relay) {
            Ok(resolved) => resolved,
            Err(err) => {
                info!("dropping datagram from {}: {}", peer, err);
                return;
            }
        };

        let packet = match decode_packet(ip, payload) {
            Ok(packet) => packet,
            Err(err) => {
                info!("dropping invalid packet from {}: {}", peer, err);
                return;
            }
        };

        let source = Source {
            endpoint: Arc::clone(self),
            socket_addr: peer,
            ip,
            port,
        };
        handler.handle_packet(source, packet).await;
    }

    /// Determine the effective source of a datagram and strip any PROXY
    /// header. V4-mapped addresses are canonicalized so a server keeps one
    /// identity whether it reaches us over an IPv4 or a dual-stack socket.
    fn resolve_source<'a>(
        &self,
        data: &'a [u8],
        peer: SocketAddr,
        from_relay: bool,
    ) -> Result<(IpAddr, u16, &'a [u8]), ProtocolError> {
        if from_relay || !self.proxy_protocol {
            return Ok((peer.ip().to_canonical(), peer.port(), data));
        }

        if has_proxy_header(data) {
            let ((ip, port), payload) = parse_proxy_header(data)?;
            let ip = ip.to_canonical();
            self.proxy_flows.lock().insert(peer, (ip, port));
            return Ok((ip, port, payload));
        }

        match self.proxy_flows.lock().get(&peer) {
            Some(&(ip, port)) => Ok((ip, port, data)),
            None => Err(ProtocolError::NoProxyHeader),
        }
    }

    /// Send raw packet bytes to `addr`. An IPv4 destination is rewritten to
    /// its v4-mapped form when this socket is IPv6.
    pub async fn send(&self, addr: SocketAddr, data: &[u8]) -> Result<(), SendError> {
        let addr = self.map_destination(addr);
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    pub async fn send_find_server(&self, ip: IpAddr, port: u16) -> Result<(), SendError> {
        let data = send::client_find_server()?;
        self.send(SocketAddr::new(ip, port), &data).await
    }

    fn map_destination(&self, addr: SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(v4) if self.is_ipv6 => SocketAddr::V6(SocketAddrV6::new(
                v4.ip().to_ipv6_mapped(),
                v4.port(),
                0,
                0,
            )),
            other => other,
        }
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("local_addr", &self.local_addr)
            .field("proxy_protocol", &self.proxy_protocol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn endpoint(proxy: bool) -> Arc<UdpEndpoint> {
        UdpEndpoint::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, proxy, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_source_plain() {
        let ep = endpoint(false).await;
        let peer: SocketAddr = "127.0.0.1:55000".parse().unwrap();
        let (ip, port, payload) = ep.resolve_source(b"\x03\x00\x00", peer, false).unwrap();
        assert_eq!(ip, peer.ip());
        assert_eq!(port, 55000);
        assert_eq!(payload, b"\x03\x00\x00");
    }

    #[tokio::test]
    async fn test_resolve_source_canonicalizes_mapped() {
        let ep = endpoint(false).await;
        let peer: SocketAddr = "[::ffff:10.0.0.1]:55000".parse().unwrap();
        let (ip, _, _) = ep.resolve_source(b"", peer, false).unwrap();
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_source_proxy_header_and_flow_reuse() {
        let ep = endpoint(true).await;
        let peer: SocketAddr = "127.0.0.1:41000".parse().unwrap();

        let data = b"PROXY UDP4 10.1.2.3 127.0.0.1 55123 3978\r\n\x03\x00\x00";
        let (ip, port, payload) = ep.resolve_source(data, peer, false).unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(port, 55123);
        assert_eq!(payload, b"\x03\x00\x00");

        // Follow-up datagram of the same flow arrives without a header.
        let (ip, port, payload) = ep.resolve_source(b"\x04\x00\x06\x01", peer, false).unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(port, 55123);
        assert_eq!(payload, b"\x04\x00\x06\x01");
    }

    #[tokio::test]
    async fn test_resolve_source_proxy_required() {
        let ep = endpoint(true).await;
        let peer: SocketAddr = "127.0.0.1:41001".parse().unwrap();
        assert_eq!(
            ep.resolve_source(b"\x03\x00\x00", peer, false),
            Err(ProtocolError::NoProxyHeader)
        );
        // Relayed datagrams bypass the demux entirely.
        assert!(ep.resolve_source(b"\x03\x00\x00", peer, true).is_ok());
    }

    #[tokio::test]
    async fn test_map_destination() {
        let ep4 = endpoint(false).await;
        let v4: SocketAddr = "10.0.0.1:3979".parse().unwrap();
        assert_eq!(ep4.map_destination(v4), v4);

        let ep6 = UdpEndpoint::bind("::1".parse().unwrap(), 0, false, None)
            .await
            .unwrap();
        let mapped = ep6.map_destination(v4);
        assert_eq!(mapped, "[::ffff:10.0.0.1]:3979".parse().unwrap());

        let v6: SocketAddr = "[2001:db8::1]:3979".parse().unwrap();
        assert_eq!(ep6.map_destination(v6), v6);
    }
}
