//! Link-state advertisement structures for the wire protocol.

use crate::codec::{get_count, get_i32, get_peer, put_count, put_peer};
use crate::{PeerId, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Encoded size of one neighbor entry
const NEIGHBOR_COST_SIZE: usize = PeerId::SIZE + 4;

/// A neighbor and the cost of the link to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborCost {
    /// Neighbor identifier
    pub peer: PeerId,
    /// Link cost (lower is better)
    pub cost: u32,
}

impl NeighborCost {
    /// Create a new neighbor entry
    pub fn new(peer: PeerId, cost: u32) -> Self {
        Self { peer, cost }
    }
}

/// Link-state advertisement: the full outgoing edge set of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    /// Peer whose links are described
    pub peer: PeerId,
    /// Direct neighbors of that peer
    pub neighbors: Vec<NeighborCost>,
}

impl LinkState {
    /// Create a new link-state advertisement
    pub fn new(peer: PeerId, neighbors: Vec<NeighborCost>) -> Self {
        Self { peer, neighbors }
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        put_peer(buf, &self.peer);
        put_count(buf, self.neighbors.len());
        for neighbor in &self.neighbors {
            put_peer(buf, &neighbor.peer);
            // Costs are carried as non-negative int32 values
            buf.put_i32(i32::try_from(neighbor.cost).unwrap_or(i32::MAX));
        }
    }

    pub(crate) fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let peer = get_peer(buf)?;
        let count = get_count(buf, NEIGHBOR_COST_SIZE)?;
        let mut neighbors = Vec::with_capacity(count);
        for _ in 0..count {
            let neighbor = get_peer(buf)?;
            let cost = get_i32(buf)?;
            if cost < 0 {
                return Err(WireError::Cost(cost));
            }
            neighbors.push(NeighborCost::new(neighbor, cost as u32));
        }
        Ok(Self { peer, neighbors })
    }
}
