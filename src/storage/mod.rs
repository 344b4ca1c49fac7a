//! Per-stream ring buffers.
//!
//! Both buffers are fixed-capacity rings indexed by the low-order bits of a
//! sequence number (spec §3, §9): O(1) lookup, no allocation once created,
//! and no dependency between a packet's lifetime and its position in a
//! dynamically-growing container.

mod incoming;
mod outgoing;

pub use self::incoming::IncomingBuffer;
pub use self::outgoing::{OutgoingBuffer, OutgoingPacket};

/// The buffers are sized well under the 2^15 half-circle bound from spec §3
/// so that wrap-aware sequence comparisons inside the window stay
/// unambiguous even under reordering.
pub const WINDOW_CAPACITY: usize = 2048;
