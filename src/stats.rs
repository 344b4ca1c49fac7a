//! Statistics counters (spec §6), named for compatibility with existing
//! µTP analysis tooling. These are per-event-loop; an embedder running
//! several [`crate::iface::Manager`]s merges them on query.

/// Counters for one socket manager / event loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub utp_packets_in: u64,
    pub utp_packets_out: u64,
    pub utp_payload_pkts_in: u64,
    pub utp_invalid_pkts_in: u64,
    pub utp_redundant_pkts_in: u64,
    pub utp_fast_retransmit: u64,
    pub utp_packet_resend: u64,
    pub utp_packet_loss: u64,
    pub utp_timeout: u64,
    pub utp_samples_above_target: u64,
    pub utp_samples_below_target: u64,
}

impl Counters {
    pub const fn new() -> Counters {
        Counters {
            utp_packets_in: 0,
            utp_packets_out: 0,
            utp_payload_pkts_in: 0,
            utp_invalid_pkts_in: 0,
            utp_redundant_pkts_in: 0,
            utp_fast_retransmit: 0,
            utp_packet_resend: 0,
            utp_packet_loss: 0,
            utp_timeout: 0,
            utp_samples_above_target: 0,
            utp_samples_below_target: 0,
        }
    }

    /// Fold another loop's counters into this one, for multi-loop embedders.
    pub fn merge(&mut self, other: &Counters) {
        self.utp_packets_in += other.utp_packets_in;
        self.utp_packets_out += other.utp_packets_out;
        self.utp_payload_pkts_in += other.utp_payload_pkts_in;
        self.utp_invalid_pkts_in += other.utp_invalid_pkts_in;
        self.utp_redundant_pkts_in += other.utp_redundant_pkts_in;
        self.utp_fast_retransmit += other.utp_fast_retransmit;
        self.utp_packet_resend += other.utp_packet_resend;
        self.utp_packet_loss += other.utp_packet_loss;
        self.utp_timeout += other.utp_timeout;
        self.utp_samples_above_target += other.utp_samples_above_target;
        self.utp_samples_below_target += other.utp_samples_below_target;
    }
}
