//! Fatal, per-stream error conditions (spec §7).
//!
//! These are distinct from [`crate::wire::Error`], which is the codec's own
//! lightweight parse-failure marker: a [`wire::Error`](crate::wire::Error) is
//! recoverable (the packet is dropped and counted), an [`Error`] here is
//! terminal for the stream it belongs to.

use thiserror::Error as ThisError;

/// A terminal error for a single [`crate::socket::Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    /// RESET received before the handshake completed, or the connect timeout
    /// (`utp_connect_timeout_ms`) elapsed first.
    #[error("connection refused")]
    ConnectionRefused,

    /// RESET received on an already-connected stream.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// `utp_num_resends` consecutive retransmit timeouts with no ack.
    #[error("timed out after {resends} consecutive retransmit timeouts")]
    TimedOut { resends: u32 },

    /// A malformed header from a connected peer, repeated often enough to be
    /// treated as fatal rather than merely dropped-and-counted.
    #[error("invalid packet from peer")]
    InvalidPacket,

    /// The UDP collaborator reported a terminal send failure (e.g. an
    /// ICMP port/host-unreachable bounced back to the socket).
    #[error("remote address unreachable")]
    AddressUnreachable,
}

/// Non-fatal back-pressure: the send queue is at `send_socket_buffer_size`
/// and cannot accept more bytes right now. Not an [`Error`] — the caller
/// should retry once the stream becomes writable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("send buffer is full")]
pub struct BufferFull;
