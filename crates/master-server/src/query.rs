// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outstanding server probes.
//!
//! Before an announced server makes it into the registry, the master has to
//! verify it is actually reachable: it sends CLIENT_FIND_SERVER to the
//! announced `(ip, port)` and waits for the SERVER_RESPONSE to come back on
//! the normal datagram path. The tracker keeps at most one pending probe
//! per `(ip, port)`; a matching response cancels the probe task before its
//! next retransmit can fire.

use crate::socks::SocksUdpAssociation;
use crate::udp::UdpEndpoint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Why a probe is outstanding; handed back to the handler on response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPurpose {
    /// A REGISTER is waiting for confirmation. `reply_addr` is the socket
    /// address the REGISTER came from; the ACK goes there, not to the
    /// game-server port that answers the probe.
    Register {
        session_key: u64,
        reply_addr: SocketAddr,
    },
    /// Periodic liveness re-query by the updater role.
    Refresh,
}

struct PendingQuery {
    cancel: oneshot::Sender<()>,
    purpose: QueryPurpose,
}

/// Called when a probe exhausts its retries without an answer.
pub type RetryReachedFn = dyn Fn(IpAddr, u16) + Send + Sync;

pub struct QueryTracker {
    pending: Mutex<HashMap<(IpAddr, u16), PendingQuery>>,
    timeout: Duration,
    retries: u32,
    retry_reached: Option<Arc<RetryReachedFn>>,
}

impl QueryTracker {
    pub fn new(
        timeout: Duration,
        retries: u32,
        retry_reached: Option<Arc<RetryReachedFn>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            retries,
            retry_reached,
        })
    }

    /// Start probing `(ip, port)`. A probe already in flight for the same
    /// address wins; this keeps a REGISTER flood from fanning out.
    pub fn start_query(
        self: &Arc<Self>,
        endpoint: Arc<UdpEndpoint>,
        ip: IpAddr,
        port: u16,
        purpose: QueryPurpose,
    ) {
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&(ip, port)) {
                debug!(%ip, port, "probe already pending");
                return;
            }
            let (cancel_tx, cancel_rx) = oneshot::channel();
            pending.insert(
                (ip, port),
                PendingQuery {
                    cancel: cancel_tx,
                    purpose,
                },
            );

            let tracker = Arc::clone(self);
            tokio::spawn(async move {
                tracker.probe_task(endpoint, ip, port, cancel_rx).await;
            });
        }
    }

    /// A response arrived from `(ip, port)`. Cancels the pending probe and
    /// returns its purpose; `None` means the response was unsolicited.
    pub fn on_response(&self, ip: IpAddr, port: u16) -> Option<QueryPurpose> {
        let entry = self.pending.lock().remove(&(ip, port))?;
        let _ = entry.cancel.send(());
        Some(entry.purpose)
    }

    /// Number of probes currently outstanding.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn probe_task(
        &self,
        endpoint: Arc<UdpEndpoint>,
        ip: IpAddr,
        port: u16,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut retries_left = self.retries;
        while retries_left > 0 {
            if endpoint.socks_url().is_some() {
                let cancelled = self
                    .probe_via_socks(&endpoint, ip, port, &mut cancel_rx)
                    .await;
                if cancelled {
                    return;
                }
            } else {
                if let Err(err) = endpoint.send_find_server(ip, port).await {
                    warn!(%ip, port, "failed to send probe: {}", err);
                }
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(self.timeout) => {}
                }
            }
            retries_left -= 1;
        }

        // Only the task that still owns the entry reports the failure; a
        // response racing us here wins.
        if self.pending.lock().remove(&(ip, port)).is_some() {
            debug!(%ip, port, "server did not answer any probe");
            if let Some(callback) = &self.retry_reached {
                callback(ip, port);
            }
        }
    }

    /// One probe attempt through the SOCKS relay: a fresh association per
    /// attempt, its reply raced against the probe timeout. The relay
    /// sockets close when the association drops, on every path.
    ///
    /// Returns `true` when the probe was cancelled; the cancel signal is
    /// consumed, so the caller must not poll `cancel_rx` afterwards.
    async fn probe_via_socks(
        &self,
        endpoint: &Arc<UdpEndpoint>,
        ip: IpAddr,
        port: u16,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> bool {
        let url = match endpoint.socks_url() {
            Some(url) => url,
            None => return false,
        };
        let target = SocketAddr::new(ip, port);

        let association = match SocksUdpAssociation::connect(&url).await {
            Ok(association) => association,
            Err(err) => {
                warn!(%ip, port, "SOCKS association failed: {}", err);
                return tokio::select! {
                    _ = &mut *cancel_rx => true,
                    _ = tokio::time::sleep(self.timeout) => false,
                };
            }
        };

        let probe = match crate::protocol::send::client_find_server() {
            Ok(probe) => probe,
            Err(err) => {
                warn!("failed to encode probe: {}", err);
                return false;
            }
        };
        if let Err(err) = association.send_to(&probe, target).await {
            warn!(%ip, port, "failed to send probe via SOCKS: {}", err);
        }

        tokio::select! {
            _ = &mut *cancel_rx => true,
            _ = tokio::time::sleep(self.timeout) => false,
            _ = async {
                match association.recv().await {
                    // The reply re-enters the regular datagram path, as if
                    // the server had answered us directly.
                    Ok(data) => endpoint.inject_datagram(data, target).await,
                    Err(err) => debug!(%ip, port, "SOCKS relay receive failed: {}", err),
                }
                // Keep the association open until timeout or cancellation;
                // the injected response cancels us through `on_response`.
                std::future::pending::<()>().await;
            } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn test_endpoint() -> Arc<UdpEndpoint> {
        UdpEndpoint::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false, None)
            .await
            .unwrap()
    }

    fn purpose() -> QueryPurpose {
        QueryPurpose::Register {
            session_key: 1,
            reply_addr: "127.0.0.1:55000".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_start_query_dedups() {
        let tracker = QueryTracker::new(Duration::from_secs(5), 3, None);
        let endpoint = test_endpoint().await;

        tracker.start_query(endpoint.clone(), TARGET, 4000, purpose());
        tracker.start_query(endpoint, TARGET, 4000, QueryPurpose::Refresh);
        assert_eq!(tracker.pending_count(), 1);

        // The first purpose is the one kept.
        assert_eq!(tracker.on_response(TARGET, 4000), Some(purpose()));
    }

    #[tokio::test]
    async fn test_on_response_unsolicited() {
        let tracker = QueryTracker::new(Duration::from_secs(5), 3, None);
        assert_eq!(tracker.on_response(TARGET, 4001), None);
    }

    #[tokio::test]
    async fn test_on_response_cancels() {
        let tracker = QueryTracker::new(Duration::from_secs(5), 3, None);
        let endpoint = test_endpoint().await;

        tracker.start_query(endpoint, TARGET, 4002, purpose());
        assert!(tracker.on_response(TARGET, 4002).is_some());
        assert_eq!(tracker.pending_count(), 0);
        // A second response for the same address is unsolicited.
        assert_eq!(tracker.on_response(TARGET, 4002), None);
    }

    #[tokio::test]
    async fn test_retry_reached_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let tracker = QueryTracker::new(
            Duration::from_millis(10),
            2,
            Some(Arc::new(move |ip, port| {
                assert_eq!(ip, TARGET);
                assert_eq!(port, 4003);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let endpoint = test_endpoint().await;

        tracker.start_query(endpoint, TARGET, 4003, purpose());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_callback_after_response() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let tracker = QueryTracker::new(
            Duration::from_millis(10),
            2,
            Some(Arc::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let endpoint = test_endpoint().await;

        tracker.start_query(endpoint, TARGET, 4004, purpose());
        assert!(tracker.on_response(TARGET, 4004).is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
