//! Session error types.

use mesh_wire::{PacketType, WireError};
use thiserror::Error;

/// Connection and handshake errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The connection is closed
    #[error("connection closed{}", .0.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    Closed(Option<String>),

    /// A protocol step did not finish in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A different packet arrived than the protocol expects
    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(PacketType),

    /// Transport error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed control packet
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
