//! Router error types.

use crate::discovery::ModuleId;
use mesh_session::SessionError;
use mesh_topology::TopologyError;
use mesh_wire::PeerId;
use thiserror::Error;

/// Errors reported by the router and connection establishment
#[derive(Error, Debug)]
pub enum RouterError {
    /// No address is known for a peer that must be connected directly
    #[error("no address known for peer {0}")]
    NoAddress(PeerId),

    /// Route planning failed
    #[error("route planning failed: {0}")]
    Topology(#[from] TopologyError),

    /// A hop connection failed
    #[error("connection failed: {0}")]
    Session(#[from] SessionError),

    /// A confirmation came from a peer that was not expected
    #[error("unexpected confirmation from {0}")]
    ConfirmationMismatch(PeerId),

    /// A routed connection ended here without this peer being a destination
    #[error("routed connection from {0} does not list this peer as a destination")]
    NotADestination(PeerId),

    /// A hop plan arrived that is not rooted at this peer
    #[error("hop plan rooted at {0}, not at this peer")]
    MisroutedHandshake(PeerId),

    /// The module is not registered
    #[error("unknown module {0}")]
    UnknownModule(ModuleId),

    /// The router task is gone
    #[error("router stopped")]
    Stopped,
}
