//! Stream framing for control packets.
//!
//! This module splits a byte stream into packets using the type-tag and
//! length header, independent of whether the type itself is understood.

use crate::header::{PacketHeader, HEADER_SIZE};
use crate::packet::Packet;
use bytes::{Buf, BytesMut};
use tracing::trace;

/// Maximum packet size (1 MiB default)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Maximum nesting of an encoded hop tree
pub const MAX_TREE_DEPTH: usize = 64;

/// Packet decoder for parsing incoming byte streams
#[derive(Debug)]
pub struct PacketDecoder {
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a new packet decoder
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Create a decoder with a custom body size limit
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Decode one packet from a buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A complete packet whose
    /// body is malformed or whose type is unknown is consumed from the buffer
    /// before the error is returned, so decoding can continue with the next
    /// packet. An oversize length is not consumed: the stream cannot be
    /// resynchronised after it.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, crate::WireError> {
        let Some(header) = PacketHeader::peek(buf) else {
            return Ok(None);
        };

        let body_len = header.body_len as usize;
        if body_len > self.max_packet_size {
            return Err(crate::WireError::Size(body_len));
        }

        if buf.len() < HEADER_SIZE + body_len {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();
        trace!("Decoding packet type {} ({} bytes)", header.tag, body_len);

        Packet::decode_body(header.tag, body).map(Some)
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}
