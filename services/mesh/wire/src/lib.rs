//! Control packet framing, encoding/decoding, peer identifiers and hop trees for mesh.
//!
//! This crate provides the low-level wire protocol for the routing core: the
//! small set of control packets exchanged between peers, the type-tag plus
//! length framing that lets a receiver locate packet boundaries inside a byte
//! stream, and the value types (peer identifiers, hop trees) those packets
//! carry.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 packet_type       | type tag                   |
//! +----------------------+----------------------------+
//! | u32 body_len         | length of bytes that follow|
//! +----------------------+----------------------------+
//! | body                 | type-specific fields       |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are big-endian. Peer identifiers are 16 raw UUID bytes.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod packet;
pub mod peer;
pub mod topology;
pub mod tree;

// Re-export main types
pub use error::WireError;
pub use frame::{PacketDecoder, DEFAULT_MAX_PACKET_SIZE, MAX_TREE_DEPTH};
pub use header::{PacketHeader, PacketType, HEADER_SIZE};
pub use packet::{
    ConnectionConfirmation, FloodingEnvelope, LinkHandshake, LinkPurpose, MulticastHandshake,
    Packet,
};
pub use peer::PeerId;
pub use topology::{LinkState, NeighborCost};
pub use tree::Tree;
