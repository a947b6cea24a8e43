//! Sequence-numbered flooding of control packets.
//!
//! Every originator stamps its packets with a strictly increasing sequence
//! number. A receiver accepts an envelope only if its sequence number is
//! higher than anything seen from that originator, forwards it unchanged to
//! every other neighbor and hands the decoded payload back to the caller.

use bytes::Bytes;
use mesh_wire::{FloodingEnvelope, Packet, PeerId};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Outbound side of the flooding manager
pub trait FloodingTransport {
    /// Current direct neighbors
    fn neighbors(&self) -> Vec<PeerId>;

    /// Send an encoded frame to one neighbor
    fn send(&mut self, neighbor: &PeerId, frame: Bytes);
}

/// Flooding state for one peer
#[derive(Debug)]
pub struct FloodingPacketManager {
    local_id: PeerId,
    current_sequence: i32,
    highest_seen: HashMap<PeerId, i32>,
}

impl FloodingPacketManager {
    /// Create a manager whose first flooded packet carries sequence number 1
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            current_sequence: 1,
            highest_seen: HashMap::new(),
        }
    }

    /// Wrap a packet in a new envelope and send it to every neighbor
    pub fn flood<T: FloodingTransport>(&mut self, packet: &Packet, transport: &mut T) -> FloodingEnvelope {
        let sequence_number = self.current_sequence;
        if sequence_number == i32::MAX {
            // Repeats of the last number are dropped downstream as duplicates
            warn!("Flooding sequence numbers exhausted for {}, holding at {}", self.local_id, i32::MAX);
        }
        self.current_sequence = self.current_sequence.saturating_add(1);
        self.highest_seen.insert(self.local_id, sequence_number);

        let envelope = FloodingEnvelope::new(sequence_number, self.local_id, packet.encode());
        let frame = Packet::Flooding(envelope.clone()).encode();
        let neighbors = transport.neighbors();
        for neighbor in &neighbors {
            transport.send(neighbor, frame.clone());
        }
        debug!(
            "Flooded {:?} packet seq {} to {} neighbors",
            packet.packet_type(),
            sequence_number,
            neighbors.len()
        );
        envelope
    }

    /// Process an envelope received from a neighbor.
    ///
    /// Returns the decoded inner packet if the envelope was new. Stale and
    /// duplicate envelopes are dropped without forwarding. A payload that
    /// fails to decode is still forwarded, since other peers may understand
    /// it, but nothing is returned.
    pub fn handle_incoming<T: FloodingTransport>(
        &mut self,
        from: &PeerId,
        envelope: FloodingEnvelope,
        transport: &mut T,
    ) -> Option<Packet> {
        if let Some(&highest) = self.highest_seen.get(&envelope.origin) {
            if envelope.sequence_number <= highest {
                trace!(
                    "Dropping flooded packet from {} (seq {} <= {})",
                    envelope.origin,
                    envelope.sequence_number,
                    highest
                );
                return None;
            }
        }
        self.highest_seen
            .insert(envelope.origin, envelope.sequence_number);

        let payload = envelope.payload.clone();
        let origin = envelope.origin;
        let frame = Packet::Flooding(envelope).encode();
        for neighbor in transport.neighbors() {
            if neighbor != *from {
                transport.send(&neighbor, frame.clone());
            }
        }

        match Packet::decode(&payload) {
            Ok(Packet::Flooding(_)) => {
                warn!("Dropping nested flooding envelope from {}", origin);
                None
            }
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!("Dropping undecodable flooded packet from {}: {}", origin, e);
                None
            }
        }
    }

    /// Highest sequence number accepted from an originator
    pub fn highest_seen(&self, origin: &PeerId) -> Option<i32> {
        self.highest_seen.get(origin).copied()
    }

    /// Local peer identifier
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{ConnectionConfirmation, LinkState, NeighborCost};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, VecDeque};

    fn id(n: u128) -> PeerId {
        PeerId::from_u128(n)
    }

    #[derive(Default)]
    struct RecordingTransport {
        neighbors: Vec<PeerId>,
        sent: Vec<(PeerId, Bytes)>,
    }

    impl FloodingTransport for RecordingTransport {
        fn neighbors(&self) -> Vec<PeerId> {
            self.neighbors.clone()
        }

        fn send(&mut self, neighbor: &PeerId, frame: Bytes) {
            self.sent.push((*neighbor, frame));
        }
    }

    fn transport(neighbors: &[u128]) -> RecordingTransport {
        RecordingTransport {
            neighbors: neighbors.iter().map(|&n| id(n)).collect(),
            sent: Vec::new(),
        }
    }

    fn unwrap_envelope(frame: &Bytes) -> FloodingEnvelope {
        match Packet::decode(frame).unwrap() {
            Packet::Flooding(envelope) => envelope,
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    fn sample_packet() -> Packet {
        Packet::LinkState(LinkState::new(id(1), vec![NeighborCost::new(id(2), 1)]))
    }

    #[test]
    fn test_flood_sends_to_every_neighbor() {
        let mut manager = FloodingPacketManager::new(id(1));
        let mut out = transport(&[2, 3]);

        let first = manager.flood(&sample_packet(), &mut out);
        let second = manager.flood(&sample_packet(), &mut out);
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert_eq!(manager.highest_seen(&id(1)), Some(2));

        assert_eq!(out.sent.len(), 4);
        assert_eq!(out.sent[0].0, id(2));
        assert_eq!(out.sent[1].0, id(3));
        assert_eq!(unwrap_envelope(&out.sent[0].1), first);
    }

    #[test]
    fn test_sequence_number_never_goes_backwards() {
        let mut manager = FloodingPacketManager::new(id(1));
        manager.current_sequence = i32::MAX - 1;
        let mut out = transport(&[2]);

        let sequences: Vec<i32> = (0..3)
            .map(|_| manager.flood(&sample_packet(), &mut out).sequence_number)
            .collect();
        assert_eq!(sequences, vec![i32::MAX - 1, i32::MAX, i32::MAX]);
        assert_eq!(manager.highest_seen(&id(1)), Some(i32::MAX));

        // A receiver keeps the highest number instead of treating it as stale
        let mut receiver = FloodingPacketManager::new(id(2));
        let mut relay = transport(&[1]);
        for (_, frame) in &out.sent {
            receiver.handle_incoming(&id(1), unwrap_envelope(frame), &mut relay);
        }
        assert_eq!(receiver.highest_seen(&id(1)), Some(i32::MAX));
    }

    #[test]
    fn test_duplicate_and_stale_dropped() {
        let mut manager = FloodingPacketManager::new(id(9));
        let mut out = transport(&[2, 3, 4]);
        let envelope = FloodingEnvelope::new(5, id(1), sample_packet().encode());

        assert_eq!(
            manager.handle_incoming(&id(2), envelope.clone(), &mut out),
            Some(sample_packet())
        );
        // Forwarded to everyone but the sender
        let forwarded: Vec<PeerId> = out.sent.iter().map(|(peer, _)| *peer).collect();
        assert_eq!(forwarded, vec![id(3), id(4)]);
        assert_eq!(unwrap_envelope(&out.sent[0].1), envelope);

        // Same envelope through another neighbor
        assert_eq!(manager.handle_incoming(&id(3), envelope, &mut out), None);
        let stale = FloodingEnvelope::new(4, id(1), sample_packet().encode());
        assert_eq!(manager.handle_incoming(&id(4), stale, &mut out), None);
        assert_eq!(out.sent.len(), 2);
        assert_eq!(manager.highest_seen(&id(1)), Some(5));
    }

    #[test]
    fn test_own_packets_not_reflooded() {
        let mut manager = FloodingPacketManager::new(id(1));
        let mut out = transport(&[2]);
        let envelope = manager.flood(&sample_packet(), &mut out);
        assert_eq!(manager.handle_incoming(&id(2), envelope, &mut out), None);
        assert_eq!(out.sent.len(), 1);
    }

    #[test]
    fn test_corrupt_payload_forwarded_not_dispatched() {
        let mut manager = FloodingPacketManager::new(id(9));
        let mut out = transport(&[2, 3]);
        let envelope = FloodingEnvelope::new(1, id(1), Bytes::from_static(b"\x7f\x00\x00\x00\x00"));
        assert_eq!(manager.handle_incoming(&id(2), envelope, &mut out), None);
        assert_eq!(out.sent.len(), 1);

        // A later good packet from the same origin still gets through
        let good = FloodingEnvelope::new(2, id(1), sample_packet().encode());
        assert_eq!(
            manager.handle_incoming(&id(2), good, &mut out),
            Some(sample_packet())
        );
    }

    #[test]
    fn test_chain_delivers_once() {
        // A - B - C, A and C not directly connected
        let (a, b, c) = (id(1), id(2), id(3));
        let mut manager_a = FloodingPacketManager::new(a);
        let mut manager_b = FloodingPacketManager::new(b);
        let mut manager_c = FloodingPacketManager::new(c);
        let mut out_a = transport(&[2]);
        let mut out_b = transport(&[1, 3]);
        let mut out_c = transport(&[2]);

        let payload = Packet::Confirmation(ConnectionConfirmation::new(a));
        manager_a.flood(&payload, &mut out_a);
        assert_eq!(out_a.sent.len(), 1);

        let at_b = unwrap_envelope(&out_a.sent[0].1);
        assert_eq!(manager_b.handle_incoming(&a, at_b, &mut out_b), Some(payload.clone()));
        assert_eq!(out_b.sent.len(), 1);
        assert_eq!(out_b.sent[0].0, c);

        let at_c = unwrap_envelope(&out_b.sent[0].1);
        assert_eq!(manager_c.handle_incoming(&b, at_c.clone(), &mut out_c), Some(payload));
        // C's only neighbor is the sender
        assert!(out_c.sent.is_empty());
        assert_eq!(manager_c.handle_incoming(&b, at_c, &mut out_c), None);
    }

    #[test]
    fn test_random_graph_liveness() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..20 {
            let size = rng.gen_range(2..12u128);
            let mut adjacency: BTreeMap<u128, Vec<u128>> = BTreeMap::new();
            let link = |a: u128, b: u128, adjacency: &mut BTreeMap<u128, Vec<u128>>| {
                if a != b && !adjacency.entry(a).or_default().contains(&b) {
                    adjacency.entry(a).or_default().push(b);
                    adjacency.entry(b).or_default().push(a);
                }
            };
            for peer in 1..size {
                let other = rng.gen_range(0..peer);
                link(peer, other, &mut adjacency);
            }
            for _ in 0..size {
                let (x, y) = (rng.gen_range(0..size), rng.gen_range(0..size));
                link(x, y, &mut adjacency);
            }

            let mut managers: BTreeMap<u128, FloodingPacketManager> =
                (0..size).map(|peer| (peer, FloodingPacketManager::new(id(peer)))).collect();
            let mut delivered: BTreeMap<u128, usize> = BTreeMap::new();
            let mut in_flight: VecDeque<(u128, u128, Bytes)> = VecDeque::new();

            let origin = rng.gen_range(0..size);
            let mut out = transport(&adjacency[&origin]);
            let packet = sample_packet();
            managers.get_mut(&origin).unwrap().flood(&packet, &mut out);
            in_flight.extend(out.sent.into_iter().map(|(to, frame)| {
                (origin, to.uuid().as_u128(), frame)
            }));

            while let Some((from, to, frame)) = in_flight.pop_front() {
                let mut out = transport(&adjacency[&to]);
                let manager = managers.get_mut(&to).unwrap();
                if let Some(received) = manager.handle_incoming(&id(from), unwrap_envelope(&frame), &mut out) {
                    assert_eq!(received, packet);
                    *delivered.entry(to).or_default() += 1;
                }
                in_flight.extend(out.sent.into_iter().map(|(next, frame)| {
                    (to, next.uuid().as_u128(), frame)
                }));
            }

            for peer in 0..size {
                let expected = if peer == origin { 0 } else { 1 };
                assert_eq!(delivered.get(&peer).copied().unwrap_or(0), expected);
            }
        }
    }
}
