//! Handshake protocol helpers.
//!
//! Control packets exchanged while a connection is being set up are read
//! with a [`PacketDecoder`]. Any bytes that arrive behind the last expected
//! packet belong to the application and are pushed back onto the connection.

use crate::{Connection, SessionError, StreamEvent};
use bytes::{Bytes, BytesMut};
use mesh_wire::{ConnectionConfirmation, LinkHandshake, Packet, PacketDecoder, PeerId};
use std::time::Duration;
use tracing::{debug, trace};

/// Write one packet and wait until the transport has taken it
pub async fn send_packet(
    conn: &mut Connection,
    packet: &Packet,
    timeout: Duration,
) -> Result<(), SessionError> {
    conn.write(packet.encode())?;

    let mut held: Vec<Bytes> = Vec::new();
    let result = tokio::time::timeout(timeout, async {
        loop {
            match conn.next_event().await {
                Some(StreamEvent::Sent) => return Ok(()),
                Some(StreamEvent::Received(data)) => held.push(data),
                Some(StreamEvent::Closed { error }) => return Err(SessionError::Closed(error)),
                None => return Err(SessionError::Closed(None)),
            }
        }
    })
    .await;

    // Data that overtook the send completion stays queued in order
    for data in held.into_iter().rev() {
        conn.unread(data);
    }
    trace!("Sent {:?} packet on {}", packet.packet_type(), conn.id());
    result.unwrap_or(Err(SessionError::Timeout("send completion")))
}

/// Read exactly one packet
pub async fn recv_packet(conn: &mut Connection, timeout: Duration) -> Result<Packet, SessionError> {
    let mut decoder = PacketDecoder::new();
    let mut buf = BytesMut::new();
    let result = tokio::time::timeout(timeout, async {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(packet)) => return Ok(packet),
                Ok(None) => {}
                Err(e) => return Err(SessionError::from(e)),
            }
            match conn.next_event().await {
                Some(StreamEvent::Received(data)) => buf.extend_from_slice(&data),
                Some(StreamEvent::Sent) => continue,
                Some(StreamEvent::Closed { error }) => return Err(SessionError::Closed(error)),
                None => return Err(SessionError::Closed(None)),
            }
        }
    })
    .await;

    if !buf.is_empty() {
        conn.unread(buf.freeze());
    }
    result.unwrap_or(Err(SessionError::Timeout("packet")))
}

/// Send the link handshake that opens every direct connection
pub async fn send_link_handshake(
    conn: &mut Connection,
    handshake: LinkHandshake,
    timeout: Duration,
) -> Result<(), SessionError> {
    debug!(
        "Sending {:?} handshake as {} on {}",
        handshake.purpose,
        handshake.peer,
        conn.id()
    );
    send_packet(conn, &Packet::LinkHandshake(handshake), timeout).await
}

/// Read the link handshake of an accepted connection
pub async fn recv_link_handshake(
    conn: &mut Connection,
    timeout: Duration,
) -> Result<LinkHandshake, SessionError> {
    match recv_packet(conn, timeout).await? {
        Packet::LinkHandshake(handshake) => {
            debug!(
                "Received {:?} handshake from {} ({}) on {}",
                handshake.purpose,
                handshake.peer,
                handshake.name,
                conn.id()
            );
            Ok(handshake)
        }
        other => Err(SessionError::UnexpectedPacket(other.packet_type())),
    }
}

/// Send an end-to-end confirmation
pub async fn send_confirmation(
    conn: &mut Connection,
    sender: PeerId,
    timeout: Duration,
) -> Result<(), SessionError> {
    let packet = Packet::Confirmation(ConnectionConfirmation::new(sender));
    send_packet(conn, &packet, timeout).await
}

/// Read an end-to-end confirmation and return its sender
pub async fn recv_confirmation(
    conn: &mut Connection,
    timeout: Duration,
) -> Result<PeerId, SessionError> {
    match recv_packet(conn, timeout).await? {
        Packet::Confirmation(confirmation) => Ok(confirmation.sender),
        other => Err(SessionError::UnexpectedPacket(other.packet_type())),
    }
}
