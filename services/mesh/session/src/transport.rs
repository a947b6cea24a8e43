//! Addresses and the TCP transport for mesh connections.

use crate::{Connection, SessionError};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A reachable endpoint of a remote peer.
///
/// Addresses are produced by discovery backends. Lower cost is preferred
/// when a peer has several.
#[async_trait]
pub trait Address: Send + Sync + fmt::Debug {
    /// Route-preference metric (lower is better)
    fn cost(&self) -> u32;

    /// Stable key identifying this endpoint, used to match removals
    fn key(&self) -> String;

    /// Open a new connection. Resolves once the transport is connected.
    async fn open(&self) -> Result<Connection, SessionError>;
}

/// A TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    addr: SocketAddr,
    cost: u32,
}

impl TcpAddress {
    /// Create a new TCP address
    pub fn new(addr: SocketAddr, cost: u32) -> Self {
        Self { addr, cost }
    }

    /// Socket address
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Address for TcpAddress {
    fn cost(&self) -> u32 {
        self.cost
    }

    fn key(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn open(&self) -> Result<Connection, SessionError> {
        let stream = connect_tcp(self.addr).await?;
        debug!("Connected to {}", self.addr);
        Ok(Connection::from_io(stream))
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Accept one TCP connection and wrap it
pub async fn accept_tcp(listener: &TcpListener) -> Result<(Connection, SocketAddr), SessionError> {
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((Connection::from_io(stream), peer))
}
