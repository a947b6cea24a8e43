//! In-process discovery backends and address wrappers for tests.

use crate::discovery::{Advertiser, AdvertiserDelegate, Browser, BrowserDelegate};
use async_trait::async_trait;
use mesh_session::{Address, Connection, ConnectionHandle, MemoryNetwork, SessionError};
use mesh_wire::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Advertises by listening on a named memory endpoint
pub(crate) struct MemoryAdvertiser {
    network: MemoryNetwork,
    name: String,
    delegate: Mutex<Option<Arc<dyn AdvertiserDelegate>>>,
    listening: AtomicBool,
}

impl MemoryAdvertiser {
    pub(crate) fn new(network: MemoryNetwork, name: impl Into<String>) -> Self {
        Self {
            network,
            name: name.into(),
            delegate: Mutex::new(None),
            listening: AtomicBool::new(false),
        }
    }

    /// Wait until the endpoint accepts connections
    pub(crate) async fn wait_listening(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.listening.load(Ordering::SeqCst) {
            assert!(tokio::time::Instant::now() < deadline, "{} never started", self.name);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Advertiser for MemoryAdvertiser {
    fn start_advertising(&self, _local_id: PeerId, delegate: Arc<dyn AdvertiserDelegate>) {
        let mut listener = self.network.listen(self.name.clone());
        let accepting = delegate.clone();
        tokio::spawn(async move {
            while let Some(connection) = listener.accept().await {
                accepting.handle_incoming_connection(connection);
            }
        });
        *self.delegate.lock().unwrap() = Some(delegate.clone());
        self.listening.store(true, Ordering::SeqCst);
        delegate.did_start();
    }

    fn stop_advertising(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.network.unlisten(&self.name);
        if let Some(delegate) = self.delegate.lock().unwrap().take() {
            delegate.did_stop();
        }
    }
}

/// Browser driven by the test. Addresses reported before the browser has
/// started are replayed on start.
#[derive(Default)]
pub(crate) struct ManualBrowser {
    known: Mutex<Vec<(PeerId, Arc<dyn Address>)>>,
    delegate: Mutex<Option<Arc<dyn BrowserDelegate>>>,
}

impl ManualBrowser {
    pub(crate) fn discover(&self, peer: PeerId, address: impl Address + 'static) {
        let address: Arc<dyn Address> = Arc::new(address);
        self.known.lock().unwrap().push((peer, address.clone()));
        let delegate = self.delegate.lock().unwrap().clone();
        if let Some(delegate) = delegate {
            delegate.did_discover_address(peer, address);
        }
    }

    pub(crate) fn remove(&self, peer: PeerId, key: &str) {
        self.known
            .lock()
            .unwrap()
            .retain(|(known, address)| *known != peer || address.key() != key);
        let delegate = self.delegate.lock().unwrap().clone();
        if let Some(delegate) = delegate {
            delegate.did_remove_address(peer, key.to_string());
        }
    }
}

impl Browser for ManualBrowser {
    fn start_browsing(&self, delegate: Arc<dyn BrowserDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate.clone());
        delegate.did_start();
        let known = self.known.lock().unwrap().clone();
        for (peer, address) in known {
            delegate.did_discover_address(peer, address);
        }
    }

    fn stop_browsing(&self) {
        if let Some(delegate) = self.delegate.lock().unwrap().take() {
            delegate.did_stop();
        }
    }
}

/// Records every connection opened through the wrapped address
#[derive(Debug)]
pub(crate) struct TrackingAddress {
    inner: Arc<dyn Address>,
    opened: Mutex<Vec<ConnectionHandle>>,
}

impl TrackingAddress {
    pub(crate) fn new(inner: impl Address + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Wait until every opened connection has closed
    pub(crate) async fn wait_all_closed(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let open = self
                .opened
                .lock()
                .unwrap()
                .iter()
                .filter(|handle| handle.is_connected())
                .count();
            if open == 0 {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} connections still open",
                open
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Address for TrackingAddress {
    fn cost(&self) -> u32 {
        self.inner.cost()
    }

    fn key(&self) -> String {
        self.inner.key()
    }

    async fn open(&self) -> Result<Connection, SessionError> {
        let connection = self.inner.open().await?;
        self.opened.lock().unwrap().push(connection.handle());
        Ok(connection)
    }
}
