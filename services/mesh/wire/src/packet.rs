//! Control packets and their encoding.

use crate::codec::{
    expect_end, get_bytes, get_count, get_i32, get_peer, get_tree, put_bytes, put_count,
    put_peer, put_tree,
};
use crate::header::{PacketHeader, PacketType, HEADER_SIZE};
use crate::topology::LinkState;
use crate::{PeerId, Tree, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Flooding envelope wrapping an encoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodingEnvelope {
    /// Sequence number, strictly increasing per originator
    pub sequence_number: i32,
    /// Peer that flooded the packet
    pub origin: PeerId,
    /// Encoded inner packet
    pub payload: Bytes,
}

impl FloodingEnvelope {
    /// Create a new envelope
    pub fn new(sequence_number: i32, origin: PeerId, payload: Bytes) -> Self {
        Self {
            sequence_number,
            origin,
            payload,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32(self.sequence_number);
        put_peer(buf, &self.origin);
        put_bytes(buf, &self.payload);
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let sequence_number = get_i32(buf)?;
        let origin = get_peer(buf)?;
        let payload = get_bytes(buf)?;
        Ok(Self {
            sequence_number,
            origin,
            payload,
        })
    }
}

/// Why a direct connection is being opened
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkPurpose {
    /// Control channel between neighbors, carries flooded packets
    Routing = 0,
    /// First leg of a user-level routed or multicast connection
    Routed = 1,
}

impl TryFrom<i32> for LinkPurpose {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LinkPurpose::Routing),
            1 => Ok(LinkPurpose::Routed),
            _ => Err(WireError::Purpose(value)),
        }
    }
}

/// First packet written on every direct connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandshake {
    /// Identifier of the connecting peer
    pub peer: PeerId,
    /// Connection purpose
    pub purpose: LinkPurpose,
    /// Human readable name of the connecting peer
    pub name: String,
}

impl LinkHandshake {
    /// Create a new handshake
    pub fn new(peer: PeerId, purpose: LinkPurpose, name: impl Into<String>) -> Self {
        Self {
            peer,
            purpose,
            name: name.into(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_peer(buf, &self.peer);
        buf.put_i32(self.purpose as i32);
        put_bytes(buf, self.name.as_bytes());
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let peer = get_peer(buf)?;
        let purpose = LinkPurpose::try_from(get_i32(buf)?)?;
        let name = get_bytes(buf)?;
        let name = String::from_utf8(name.to_vec()).map_err(|_| WireError::Utf8)?;
        Ok(Self {
            peer,
            purpose,
            name,
        })
    }
}

/// Hop plan sent down each leg of a routed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastHandshake {
    /// Peer that requested the connection
    pub source: PeerId,
    /// Every final destination of the connection
    pub destinations: Vec<PeerId>,
    /// Remaining hop tree, rooted at the receiving peer
    pub next_hop_tree: Tree<PeerId>,
}

impl MulticastHandshake {
    /// Create a new multicast handshake; at least one destination is required
    pub fn new(
        source: PeerId,
        destinations: Vec<PeerId>,
        next_hop_tree: Tree<PeerId>,
    ) -> Result<Self, WireError> {
        if destinations.is_empty() {
            return Err(WireError::Count(0));
        }
        Ok(Self {
            source,
            destinations,
            next_hop_tree,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_peer(buf, &self.source);
        put_count(buf, self.destinations.len());
        for destination in &self.destinations {
            put_peer(buf, destination);
        }
        put_tree(buf, &self.next_hop_tree);
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self, WireError> {
        let source = get_peer(buf)?;
        let count = get_count(buf, PeerId::SIZE)?;
        if count == 0 {
            return Err(WireError::Count(0));
        }
        let mut destinations = Vec::with_capacity(count);
        for _ in 0..count {
            destinations.push(get_peer(buf)?);
        }
        let next_hop_tree = get_tree(buf)?;
        Ok(Self {
            source,
            destinations,
            next_hop_tree,
        })
    }
}

/// End-to-end confirmation of a routed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfirmation {
    /// Peer sending the confirmation
    pub sender: PeerId,
}

impl ConnectionConfirmation {
    /// Create a new confirmation
    pub fn new(sender: PeerId) -> Self {
        Self { sender }
    }
}

/// Any control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Flooding envelope
    Flooding(FloodingEnvelope),
    /// Link-state advertisement
    LinkState(LinkState),
    /// Direct connection handshake
    LinkHandshake(LinkHandshake),
    /// Routed connection hop plan
    MulticastHandshake(MulticastHandshake),
    /// End-to-end confirmation
    Confirmation(ConnectionConfirmation),
}

impl Packet {
    /// Type tag of this packet
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Flooding(_) => PacketType::FloodingEnvelope,
            Packet::LinkState(_) => PacketType::LinkState,
            Packet::LinkHandshake(_) => PacketType::LinkHandshake,
            Packet::MulticastHandshake(_) => PacketType::MulticastHandshake,
            Packet::Confirmation(_) => PacketType::ConnectionConfirmation,
        }
    }

    /// Encode header and body into a contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Packet::Flooding(envelope) => envelope.encode_body(&mut body),
            Packet::LinkState(state) => state.encode_body(&mut body),
            Packet::LinkHandshake(handshake) => handshake.encode_body(&mut body),
            Packet::MulticastHandshake(handshake) => handshake.encode_body(&mut body),
            Packet::Confirmation(confirmation) => put_peer(&mut body, &confirmation.sender),
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        PacketHeader::new(self.packet_type(), body.len() as u32).encode(&mut buf);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode exactly one complete packet
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = PacketHeader::peek(bytes).ok_or(WireError::Incomplete)?;
        let mut rest = &bytes[HEADER_SIZE..];
        let body_len = header.body_len as usize;
        if rest.remaining() < body_len {
            return Err(WireError::Incomplete);
        }
        if rest.remaining() > body_len {
            return Err(WireError::Malformed);
        }
        let body = rest.copy_to_bytes(body_len);
        Self::decode_body(header.tag, body)
    }

    /// Decode a body for the given type tag
    pub fn decode_body(tag: u8, mut body: Bytes) -> Result<Self, WireError> {
        let packet = match PacketType::try_from(tag)? {
            PacketType::FloodingEnvelope => {
                Packet::Flooding(FloodingEnvelope::decode_body(&mut body)?)
            }
            PacketType::LinkState => Packet::LinkState(LinkState::decode_body(&mut body)?),
            PacketType::LinkHandshake => {
                Packet::LinkHandshake(LinkHandshake::decode_body(&mut body)?)
            }
            PacketType::MulticastHandshake => {
                Packet::MulticastHandshake(MulticastHandshake::decode_body(&mut body)?)
            }
            PacketType::ConnectionConfirmation => {
                Packet::Confirmation(ConnectionConfirmation::new(get_peer(&mut body)?))
            }
        };
        expect_end(&body)?;
        Ok(packet)
    }
}
