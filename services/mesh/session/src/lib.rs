//! Byte-stream connections, transports, handshakes and connection decorators for mesh.
//!
//! This crate provides the connection layer of the routing core: a
//! channel-driven [`Connection`] handle over any async byte stream, the
//! [`Address`] abstraction discovery backends hand to the router, TCP and
//! in-memory transports, helpers that exchange control packets during
//! connection setup, and the two decorators used by multi-hop connections.
//!
//! ## Features
//!
//! - **Connections**: non-blocking writes, ordered events, exactly one close
//! - **Transports**: TCP dialer/listener and an in-process network for tests
//! - **Handshakes**: packet exchange that preserves trailing application bytes
//! - **Forking**: relay-side mirroring between an incoming and an outgoing stream
//! - **Multicast**: one logical write fanned out to several subconnections
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use mesh_session::{Address, TcpAddress};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let address = TcpAddress::new("127.0.0.1:7400".parse()?, 1);
//! let mut connection = address.open().await?;
//! connection.write(Bytes::from_static(b"hello"))?;
//! let reply = connection.recv().await?;
//! println!("received {} bytes", reply.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod forking;
pub mod handshake;
pub mod memory;
pub mod multicast;
pub mod transport;

// Re-export main types
pub use connection::{Connection, ConnectionHandle, ConnectionId, EventStream, StreamEvent};
pub use error::SessionError;
pub use forking::ForkingConnection;
pub use handshake::{
    recv_confirmation, recv_link_handshake, recv_packet, send_confirmation, send_link_handshake,
    send_packet,
};
pub use memory::{MemoryAddress, MemoryListener, MemoryNetwork};
pub use multicast::MulticastConnection;
pub use transport::{accept_tcp, connect_tcp, listen_tcp, Address, TcpAddress};
