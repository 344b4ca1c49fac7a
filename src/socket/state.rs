//! Connection state machine (spec §4.9):
//! `None -> SynSent -> Connected -> FinSent -> (Closed|Reset) -> Delete`.
//! The acceptor has no separate "SYN received" phase to wait out: replying
//! with the STATE ack is itself enough to consider the stream connected.

/// Idle duration after which a connected stream sends a bare STATE probe
/// (spec §4.9 "Keepalive").
pub const KEEPALIVE_IDLE: crate::time::Duration = crate::time::Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly created, no packet exchanged yet.
    None,
    /// Initiator: SYN sent, awaiting the matching STATE ack.
    SynSent,
    Connected,
    /// FIN sent; waiting for it to be acked and for all prior packets to be
    /// delivered in both directions (spec §4.9).
    FinSent,
    Closed,
    Reset,
    /// Resources may be reclaimed (spec §3 lifecycle: only once no
    /// retransmissions are pending).
    Delete,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Reset | State::Delete)
    }

    /// `FinSent` still drains whatever was queued before the close
    /// (spec §4.9: the FIN goes out only after everything ahead of it), so
    /// it counts as sendable too.
    pub fn can_send_data(&self) -> bool {
        matches!(self, State::Connected | State::FinSent)
    }
}
