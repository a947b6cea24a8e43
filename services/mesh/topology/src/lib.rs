//! Link-state routing table, multicast hop trees and flooding dissemination for mesh.
//!
//! This crate holds the pure, I/O-free state machines of the routing core:
//! the weighted peer graph with its shortest-path table and change
//! detection, the Steiner-tree approximation used to plan multicast
//! fan-out, and the sequence-numbered flooding manager that spreads
//! link-state information across the mesh.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flooding;
pub mod link_state;

pub use error::TopologyError;
pub use flooding::{FloodingPacketManager, FloodingTransport};
pub use link_state::*;
