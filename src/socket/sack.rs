//! Selective-ack bookkeeping (spec §4.5): building the outgoing bitmap from
//! the receive side's reorder buffer, and consuming an inbound ack plus
//! bitmap to release delivered outgoing records and detect fast-retransmit
//! conditions.

use crate::storage::{IncomingBuffer, OutgoingBuffer, OutgoingPacket};
use crate::wire::{SeqNumber, SelectiveAck};

/// How many selectively-acked packets past a gap count as a "third
/// duplicate" before the gap is fast-retransmitted (spec §4.5).
const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// Width of the bitmap advertised with each outgoing ack.
const SACK_BITMAP_BITS: usize = 64;

/// Build the selective-ack extension to attach to the next outgoing STATE
/// or DATA packet, from whatever the reorder buffer is currently holding
/// past `ack_nr`. `None` if nothing is out of order.
pub fn build_outgoing(incoming: &IncomingBuffer, ack_nr: SeqNumber) -> Option<SelectiveAck> {
    if incoming.is_empty() {
        return None;
    }
    let base = ack_nr.wrapping_add(2);
    let set: Vec<usize> = (0..SACK_BITMAP_BITS)
        .filter(|&i| incoming.contains(base.wrapping_add(i as u16)))
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(SelectiveAck::build(SACK_BITMAP_BITS, set))
    }
}

/// Result of folding one inbound ack (cumulative `ack_nr` plus optional
/// selective-ack bitmap) into the outgoing buffer.
pub struct AckOutcome {
    /// Records released from the outgoing buffer, in the order they were
    /// found — RTT samples are taken from these (spec §4.5).
    pub released: Vec<OutgoingPacket>,
    /// The oldest still-unacked sequence number, if the bitmap shows
    /// enough evidence that it was lost (spec §4.5).
    pub fast_retransmit: Option<SeqNumber>,
}

/// Tracks the fast-retransmit duplicate count across successive acks; one
/// instance per connection, since spec §4.5's "third duplicate" is counted
/// across acks, not within a single bitmap.
#[derive(Debug, Default)]
pub struct SackEngine {
    gap: Option<SeqNumber>,
    duplicate_count: u32,
}

impl SackEngine {
    pub fn new() -> SackEngine {
        SackEngine::default()
    }

    /// `old_send_base` is the previous oldest-unacked sequence number;
    /// `ack_nr` is this packet's cumulative ack. Invariant (spec §3): an
    /// outgoing record is removed at most once, so it can never be
    /// double-counted as loss by the caller.
    pub fn consume(
        &mut self,
        outgoing: &mut OutgoingBuffer,
        old_send_base: SeqNumber,
        ack_nr: SeqNumber,
        sack: Option<&SelectiveAck>,
    ) -> AckOutcome {
        let mut released = Vec::new();

        // Cumulative part: every seq up to and including ack_nr is acked.
        let mut seq = old_send_base;
        while seq <= ack_nr {
            if let Some(packet) = outgoing.remove(seq) {
                released.push(packet);
            }
            if seq == ack_nr {
                break;
            }
            seq = seq.wrapping_add(1);
        }

        // Selective part: packets past the cumulative boundary the peer has
        // already received out of order. These are released from the
        // buffer (so they are never retransmitted) but do not advance
        // `old_send_base`, since the gap at `ack_nr + 1` may still be open.
        if let Some(sack) = sack {
            let base = ack_nr.wrapping_add(2);
            for offset in sack.set_offsets() {
                if let Some(packet) = outgoing.remove(base.wrapping_add(offset as u16)) {
                    released.push(packet);
                }
            }
        }

        let gap_seq = ack_nr.wrapping_add(1);
        let gap_has_evidence = outgoing.get(gap_seq).is_some()
            && sack.is_some_and(|s| s.set_offsets().next().is_some());

        let fast_retransmit = if gap_has_evidence {
            if self.gap == Some(gap_seq) {
                self.duplicate_count += 1;
            } else {
                self.gap = Some(gap_seq);
                self.duplicate_count = 1;
            }
            if self.duplicate_count >= FAST_RETRANSMIT_THRESHOLD {
                self.duplicate_count = 0;
                Some(gap_seq)
            } else {
                None
            }
        } else {
            self.gap = None;
            self.duplicate_count = 0;
            None
        };

        AckOutcome {
            released,
            fast_retransmit,
        }
    }
}
