//! TCP discovery backends.
//!
//! The advertiser accepts connections on a listening socket. The browser
//! announces a fixed list of peers and repeats the announcement
//! periodically, which also makes the router retry peers it could not reach.

use crate::config::StaticPeer;
use mesh_routing::{Advertiser, AdvertiserDelegate, Browser, BrowserDelegate};
use mesh_session::{accept_tcp, listen_tcp, Address, TcpAddress};
use mesh_wire::PeerId;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Background task plus the delegate it reports to
struct Running<D: ?Sized> {
    task: JoinHandle<()>,
    delegate: Arc<D>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Advertises by accepting TCP connections
pub struct TcpAdvertiser {
    listen: SocketAddr,
    running: Mutex<Option<Running<dyn AdvertiserDelegate>>>,
}

impl TcpAdvertiser {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            running: Mutex::new(None),
        }
    }
}

impl Advertiser for TcpAdvertiser {
    fn start_advertising(&self, local_id: PeerId, delegate: Arc<dyn AdvertiserDelegate>) {
        let mut running = lock(&self.running);
        if let Some(previous) = running.take() {
            previous.task.abort();
        }

        let listen = self.listen;
        let reporting = delegate.clone();
        let task = tokio::spawn(async move {
            // A failed bind is not confirmed, so the supervisor retries
            let listener = match listen_tcp(listen).await {
                Ok(listener) => listener,
                Err(e) => {
                    component_warn!("discovery", "Failed to listen on {}: {}", listen, e);
                    return;
                }
            };
            component_info!("discovery", "Advertising {} on {}", local_id, listen);
            reporting.did_start();

            loop {
                match accept_tcp(&listener).await {
                    Ok((connection, remote)) => {
                        component_debug!("discovery", "Accepted {} from {}", connection.id(), remote);
                        reporting.handle_incoming_connection(connection);
                    }
                    Err(e) => {
                        component_warn!("discovery", "Accept on {} failed: {}", listen, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *running = Some(Running { task, delegate });
    }

    fn stop_advertising(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.task.abort();
        component_info!("discovery", "Stopped advertising on {}", self.listen);
        running.delegate.did_stop();
    }
}

/// Announces statically configured peers
pub struct StaticPeerBrowser {
    peers: Vec<(PeerId, TcpAddress)>,
    announce_interval: Duration,
    running: Mutex<Option<Running<dyn BrowserDelegate>>>,
}

impl StaticPeerBrowser {
    pub fn new(peers: Vec<(StaticPeer, u32)>, announce_interval: Duration) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|(peer, cost)| (peer.id, TcpAddress::new(peer.addr, cost)))
                .collect(),
            announce_interval,
            running: Mutex::new(None),
        }
    }
}

impl Browser for StaticPeerBrowser {
    fn start_browsing(&self, delegate: Arc<dyn BrowserDelegate>) {
        let mut running = lock(&self.running);
        if let Some(previous) = running.take() {
            previous.task.abort();
        }

        let peers = self.peers.clone();
        let interval = self.announce_interval;
        let reporting = delegate.clone();
        let task = tokio::spawn(async move {
            reporting.did_start();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for (peer, address) in &peers {
                    component_debug!("discovery", "Announcing {} at {}", peer, address.key());
                    reporting.did_discover_address(*peer, Arc::new(address.clone()));
                }
            }
        });
        *running = Some(Running { task, delegate });
    }

    fn stop_browsing(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.task.abort();
        for (peer, address) in &self.peers {
            running.delegate.did_remove_address(*peer, address.key());
        }
        running.delegate.did_stop();
    }
}
