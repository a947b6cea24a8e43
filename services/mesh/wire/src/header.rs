//! Packet header: type tag and body length.
//!
//! Every control packet starts with a 5-byte header so that a receiver can
//! always find the next packet boundary, even for types it does not know.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Header size in bytes (u8 type + u32 body length)
pub const HEADER_SIZE: usize = 5;

/// Packet types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Flooding envelope carrying another packet
    FloodingEnvelope = 0x01,
    /// Link-state advertisement
    LinkState = 0x02,
    /// First packet on every direct connection
    LinkHandshake = 0x03,
    /// Hop plan for a routed/multicast connection
    MulticastHandshake = 0x04,
    /// End-to-end confirmation of a routed connection
    ConnectionConfirmation = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::FloodingEnvelope),
            0x02 => Ok(PacketType::LinkState),
            0x03 => Ok(PacketType::LinkHandshake),
            0x04 => Ok(PacketType::MulticastHandshake),
            0x05 => Ok(PacketType::ConnectionConfirmation),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Raw packet header. The type tag is kept as a byte so unknown types can
/// still be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type tag
    pub tag: u8,
    /// Number of body bytes following the header
    pub body_len: u32,
}

impl PacketHeader {
    /// Create a header for a known packet type
    pub fn new(typ: PacketType, body_len: u32) -> Self {
        Self {
            tag: typ as u8,
            body_len,
        }
    }

    /// Parsed packet type
    pub fn packet_type(&self) -> Result<PacketType, crate::WireError> {
        PacketType::try_from(self.tag)
    }

    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag);
        buf.put_u32(self.body_len);
    }

    /// Peek at a header without consuming it
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut cursor = &buf[..HEADER_SIZE];
        let tag = cursor.get_u8();
        let body_len = cursor.get_u32();
        Some(Self { tag, body_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(
            PacketType::try_from(0x01).unwrap(),
            PacketType::FloodingEnvelope
        );
        assert_eq!(
            PacketType::try_from(0x05).unwrap(),
            PacketType::ConnectionConfirmation
        );
        assert!(PacketType::try_from(0x00).is_err());
        assert!(PacketType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_header_encode_peek() {
        let header = PacketHeader::new(PacketType::LinkState, 0x0102_0304);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..], &[0x02, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(PacketHeader::peek(&buf), Some(header));
        assert_eq!(PacketHeader::peek(&buf[..4]), None);
    }
}
