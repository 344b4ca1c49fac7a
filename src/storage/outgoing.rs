use crate::time::Instant;
use crate::wire::SeqNumber;

use super::WINDOW_CAPACITY;

/// A packet the socket has sent but does not yet know to be delivered.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub seq: SeqNumber,
    /// The fully-encoded wire buffer (header + extensions + payload), kept
    /// around verbatim so a retransmit reuses the same sequence number and
    /// payload bytes, rewriting only the timestamp (spec §4.3).
    pub wire_buffer: Vec<u8>,
    pub payload_len: usize,
    pub send_time: Instant,
    pub resend_count: u32,
    /// Marked for retransmission by the retransmit timer or fast-retransmit
    /// (spec §3 invariant: never double-counted as loss).
    pub need_resend: bool,
    /// Distinguishes a path-MTU probe from an ordinary data packet so its
    /// loss is never attributed to congestion (spec §4.7, §9).
    pub mtu_probe: bool,
}

/// The bounded ring of in-flight outgoing packets, indexed by the low bits
/// of the sequence number (spec §3, §9).
#[derive(Debug)]
pub struct OutgoingBuffer {
    slots: Vec<Option<OutgoingPacket>>,
    mask: usize,
    len: usize,
}

impl OutgoingBuffer {
    pub fn new() -> OutgoingBuffer {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> OutgoingBuffer {
        debug_assert!(capacity.is_power_of_two());
        OutgoingBuffer {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity - 1,
            len: 0,
        }
    }

    fn index(&self, seq: SeqNumber) -> usize {
        seq.0 as usize & self.mask
    }

    /// `cur_window_packets` (spec §3 invariant): count of non-released
    /// entries currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, packet: OutgoingPacket) {
        let idx = self.index(packet.seq);
        if self.slots[idx].is_none() {
            self.len += 1;
        }
        self.slots[idx] = Some(packet);
    }

    pub fn get(&self, seq: SeqNumber) -> Option<&OutgoingPacket> {
        let idx = self.index(seq);
        self.slots[idx].as_ref().filter(|p| p.seq == seq)
    }

    pub fn get_mut(&mut self, seq: SeqNumber) -> Option<&mut OutgoingPacket> {
        let idx = self.index(seq);
        self.slots[idx].as_mut().filter(|p| p.seq == seq)
    }

    /// Remove and return the record for `seq`, if any is still held. This is
    /// the only way a record leaves the buffer, so it can never be counted
    /// as loss twice (spec §3 invariant).
    pub fn remove(&mut self, seq: SeqNumber) -> Option<OutgoingPacket> {
        let idx = self.index(seq);
        let matches = self.slots[idx].as_ref().is_some_and(|p| p.seq == seq);
        if matches {
            self.len -= 1;
            self.slots[idx].take()
        } else {
            None
        }
    }

    /// The held packet with the smallest wrap-aware distance ahead of
    /// `anchor` — the head of the send window, and the next candidate for a
    /// retransmit timeout or fast-retransmit (spec §4.5, §4.8). `anchor` is
    /// normally the socket's `send_base` (the oldest sequence number not
    /// yet acked), so this is correct across a sequence-number wrap.
    pub fn oldest_from(&self, anchor: SeqNumber) -> Option<&OutgoingPacket> {
        self.slots
            .iter()
            .flatten()
            .min_by_key(|p| p.seq.distance(anchor))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutgoingPacket> {
        self.slots.iter().flatten()
    }
}

impl Default for OutgoingBuffer {
    fn default() -> OutgoingBuffer {
        OutgoingBuffer::new()
    }
}
