//! Topology error types.

use mesh_wire::PeerId;
use thiserror::Error;

/// Errors raised while planning routes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A destination has no route from the local peer
    #[error("destination {0} is unreachable")]
    Unreachable(PeerId),

    /// The destination set contained no remote peer
    #[error("no destinations given")]
    NoDestinations,
}
