//! In-process transport for development and testing.
//!
//! A [`MemoryNetwork`] maps endpoint names to listeners. Opening a
//! [`MemoryAddress`] creates a duplex pipe and hands the far side to the
//! listener registered under that name.

use crate::{Address, Connection, SessionError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Registry of in-memory endpoints
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<Connection>>>,
}

/// Receives connections opened to one endpoint name
#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    incoming: mpsc::UnboundedReceiver<Connection>,
}

impl MemoryListener {
    /// Endpoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next accepted connection; `None` after the endpoint is removed
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint, replacing any previous listener with that name
    pub fn listen(&self, name: impl Into<String>) -> MemoryListener {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(name.clone(), tx);
        debug!("Memory endpoint {} listening", name);
        MemoryListener { name, incoming: rx }
    }

    /// Remove an endpoint; later opens are refused
    pub fn unlisten(&self, name: &str) {
        self.listeners.remove(name);
    }

    /// Address of a named endpoint
    pub fn address(&self, name: impl Into<String>, cost: u32) -> MemoryAddress {
        MemoryAddress {
            network: self.clone(),
            name: name.into(),
            cost,
        }
    }

    fn connect(&self, name: &str) -> Result<Connection, SessionError> {
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, name.to_string());
        let listener = self.listeners.get(name).ok_or_else(refused)?.clone();
        let (local, remote) = Connection::pair();
        listener.send(remote).map_err(|_| refused())?;
        Ok(local)
    }
}

/// Address of an in-memory endpoint
#[derive(Debug, Clone)]
pub struct MemoryAddress {
    network: MemoryNetwork,
    name: String,
    cost: u32,
}

#[async_trait]
impl Address for MemoryAddress {
    fn cost(&self) -> u32 {
        self.cost
    }

    fn key(&self) -> String {
        format!("mem://{}", self.name)
    }

    async fn open(&self) -> Result<Connection, SessionError> {
        self.network.connect(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_open_reaches_listener() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("b");
        assert_eq!(listener.name(), "b");

        let address = network.address("b", 2);
        assert_eq!(address.key(), "mem://b");
        let client = address.open().await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(server.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_refused() {
        let network = MemoryNetwork::new();
        let listener = network.listen("gone");
        network.unlisten("gone");
        drop(listener);

        match network.address("gone", 1).open().await {
            Err(SessionError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
