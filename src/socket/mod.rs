/*! The µTP stream: connection state machine, send/receive buffers, SACK
engine, retransmit engine, LEDBAT congestion controller, and path-MTU
discovery wired together (spec §4, §9).

A [`Connection`] is pure logic — it never touches a socket. The owning
[`crate::iface::Manager`] calls [`Connection::poll`] from its event loop and
is responsible for actually writing the returned datagrams to the network
and for routing inbound datagrams to [`Connection::on_packet`] (spec §5).
*/

mod congestion;
mod mtu;
pub mod recv;
mod retransmit;
mod sack;
pub mod send;
mod state;

pub use self::congestion::DelaySample;
pub use self::recv::RecvQueue;
pub use self::send::SendQueue;
pub use self::state::State;

use std::net::SocketAddr;

use crate::config::Config;
use crate::error::{BufferFull, Error};
use crate::stats::Counters;
use crate::storage::{IncomingBuffer, OutgoingBuffer, OutgoingPacket};
use crate::time::{Duration, Instant};
use crate::wire::{Packet, PacketType, Repr, SeqNumber};

use self::congestion::Congestion;
use self::mtu::MtuDiscovery;
use self::retransmit::{RetransmitTimer, TimeoutOutcome};
use self::sack::SackEngine;

/// How the upper layer asked a stream to close (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Send a FIN and wait for it to be acked and for all data to drain.
    Graceful,
    /// Drop pending retransmits and send a RESET immediately.
    Reset,
}

/// Why a stream transitioned to a terminal state (spec §6 `closed(reason)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    FinAcked,
    PeerReset,
    LocalReset,
}

/// One notification out of [`Connection::poll`] / [`Connection::on_packet`]
/// (spec §6 "events surfaced to the upper layer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Readable,
    Writable,
    Closed(CloseReason),
    Error(Error),
}

/// A packet ready to hand to the UDP collaborator, addressed to this
/// stream's remote endpoint.
pub type Datagram = Vec<u8>;

/// One datagram produced by [`Connection::poll`], tagged with the outgoing
/// sequence number it was stored under (if any), so the owning
/// [`crate::iface::Manager`] can report a failed `send_to` back via
/// [`Connection::mark_send_failed`] without it being mistaken for real
/// network loss (spec §5). `STATE`/`RESET` packets carry no sequence number
/// here since they're never held in `outgoing` for retransmission.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub seq: Option<SeqNumber>,
    pub bytes: Datagram,
}

/// A single µTP stream (spec §3 "stream entity").
#[derive(Debug)]
pub struct Connection {
    config: Config,
    remote: SocketAddr,
    recv_id: u16,
    send_id: u16,
    state: State,

    send_base: SeqNumber,
    next_seq: SeqNumber,
    ack_nr: SeqNumber,
    peer_window: u32,

    send_queue: SendQueue,
    outgoing: OutgoingBuffer,
    incoming: IncomingBuffer,
    recv_queue: RecvQueue,

    congestion: Congestion,
    retransmit_timer: RetransmitTimer,
    mtu: MtuDiscovery,
    sack: SackEngine,
    srtt: Option<Duration>,

    last_recv_at: Instant,
    last_remote_timestamp: u32,

    fin_seq: Option<SeqNumber>,
    fin_resend_count: u32,
    peer_fin_seq: Option<SeqNumber>,
    reset_requested: bool,

    error: Option<Error>,
    connected_event_pending: bool,
    stats: Counters,
}

impl Connection {
    fn new(
        config: Config,
        remote: SocketAddr,
        recv_id: u16,
        send_id: u16,
        state: State,
        next_seq: SeqNumber,
        now: Instant,
    ) -> Connection {
        Connection {
            config,
            remote,
            recv_id,
            send_id,
            state,
            send_base: next_seq,
            next_seq,
            ack_nr: SeqNumber::new(0),
            peer_window: 1 << 20,
            send_queue: SendQueue::new(),
            outgoing: OutgoingBuffer::new(),
            incoming: IncomingBuffer::new(),
            recv_queue: RecvQueue::new(),
            congestion: Congestion::new(&config),
            retransmit_timer: RetransmitTimer::new(&config),
            mtu: MtuDiscovery::new(now),
            sack: SackEngine::new(),
            srtt: None,
            last_recv_at: now,
            last_remote_timestamp: 0,
            fin_seq: None,
            fin_resend_count: 0,
            peer_fin_seq: None,
            reset_requested: false,
            error: None,
            connected_event_pending: false,
            stats: Counters::default(),
        }
    }

    /// Initiator side of spec §4.9: pick `send_id = recv_id + 1` so two
    /// peers behind the same NAT can each accept the other's SYN without
    /// colliding (spec §3).
    pub fn connect(config: Config, remote: SocketAddr, recv_id: u16, now: Instant) -> (Connection, Datagram) {
        let send_id = recv_id.wrapping_add(1);
        let seq = SeqNumber::new(1);
        let mut conn = Connection::new(config, remote, recv_id, send_id, State::SynSent, seq, now);
        let syn = conn.build_and_store(PacketType::Syn, seq, &[], now);
        conn.next_seq = seq.wrapping_add(1);
        conn.retransmit_timer.rearm(now);
        (conn, syn)
    }

    /// Acceptor side: mirrors the initiator's id pair (spec §3, §4.9). The
    /// caller (the socket manager) is the one responsible for proving
    /// `recv_id` isn't already in use before calling this (spec §9).
    pub fn accept(config: Config, remote: SocketAddr, recv_id: u16, syn_seq: SeqNumber, now: Instant) -> (Connection, Datagram) {
        let send_id = recv_id.wrapping_sub(1);
        let mut conn = Connection::new(config, remote, recv_id, send_id, State::Connected, SeqNumber::new(1), now);
        conn.ack_nr = syn_seq;
        conn.connected_event_pending = true;
        let state_pkt = conn.build_state_packet(now);
        (conn, state_pkt)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn recv_id(&self) -> u16 {
        self.recv_id
    }

    pub fn send_id(&self) -> u16 {
        self.send_id
    }

    pub fn stats(&self) -> &Counters {
        &self.stats
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// Used by [`crate::iface::Manager`] right after [`Connection::accept`]
    /// once it has already surfaced the `Connected` event itself, so the
    /// pending flag doesn't fire it a second time on the first data packet.
    pub(crate) fn clear_connected_pending(&mut self) {
        self.connected_event_pending = false;
    }

    /// spec §6 `write(Stream, bytes) -> bytes_queued`.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BufferFull> {
        if self.state.is_terminal() || self.fin_seq.is_some() {
            return Err(BufferFull);
        }
        self.send_queue.write(data)
    }

    /// spec §6 `read(Stream, out_buffer) -> bytes_read`.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.recv_queue.read(out)
    }

    pub fn is_eof(&self) -> bool {
        self.recv_queue.is_eof()
    }

    /// spec §6 `close(Stream, mode)`.
    pub fn close(&mut self, mode: CloseMode) {
        match mode {
            CloseMode::Graceful => {
                if self.fin_seq.is_none() && !self.state.is_terminal() {
                    // The FIN is assigned a sequence number lazily, the
                    // next time poll() packetizes, so it goes out after
                    // whatever is still queued (spec §4.9).
                    self.state = State::FinSent;
                }
            }
            CloseMode::Reset => {
                self.reset_requested = true;
            }
        }
    }

    fn effective_mtu(&self) -> usize {
        (self.mtu.effective_mtu() as usize).max(crate::wire::HEADER_LEN + 1)
    }

    fn cwnd_headroom(&self) -> u32 {
        let in_flight: usize = self.outgoing.iter().map(|p| p.payload_len).sum();
        let window = self.congestion.cwnd().min(self.peer_window);
        window.saturating_sub(in_flight as u32)
    }

    /// The advertised `window_size` (spec §3 "receive-buffer bytes free"):
    /// total capacity minus whatever is actually occupying it right now —
    /// out-of-order payload bytes still held in `incoming`, plus delivered
    /// bytes the application hasn't read out of `recv_queue` yet. A slow
    /// reader therefore shrinks the advertised window and the peer throttles
    /// (spec §3 invariant `bytes_in_flight <= peer_advertised_window`).
    fn recv_window_bytes(&self) -> u32 {
        const RECV_WINDOW_CAPACITY: u32 = 1 << 20;
        let occupied = (self.incoming.byte_len() + self.recv_queue.len()) as u32;
        RECV_WINDOW_CAPACITY.saturating_sub(occupied)
    }

    fn build_and_store(&mut self, packet_type: PacketType, seq: SeqNumber, payload: &[u8], now: Instant) -> Datagram {
        let bytes = self.encode(packet_type, seq, payload, now);
        self.outgoing.insert(OutgoingPacket {
            seq,
            wire_buffer: bytes.clone(),
            payload_len: payload.len(),
            send_time: now,
            resend_count: 0,
            need_resend: false,
            mtu_probe: false,
        });
        self.stats.utp_packets_out += 1;
        bytes
    }

    fn encode(&mut self, packet_type: PacketType, seq: SeqNumber, payload: &[u8], now: Instant) -> Datagram {
        let reply_micro = now.as_wire_timestamp().wrapping_sub(self.last_remote_timestamp);
        self.congestion.observe_their_delay(reply_micro, now);
        let sack = sack::build_outgoing(&self.incoming, self.ack_nr);
        // Every packet but the initial SYN carries our send_id; the SYN
        // itself is special-cased to carry recv_id, so the acceptor can
        // derive its own id pair from it (spec §3, §4.9).
        let connection_id = match packet_type {
            PacketType::Syn => self.recv_id,
            _ => self.send_id,
        };
        let repr = Repr {
            packet_type,
            connection_id,
            timestamp_micros: now.as_wire_timestamp(),
            timestamp_diff_micros: reply_micro,
            window_size: self.recv_window_bytes(),
            seq_nr: seq.0,
            ack_nr: self.ack_nr.0,
            selective_ack: sack,
        };
        let mut buf = vec![0u8; repr.buffer_len(payload.len())];
        repr.emit(&mut buf, payload);
        buf
    }

    fn build_state_packet(&mut self, now: Instant) -> Datagram {
        self.encode(PacketType::State, self.next_seq, &[], now)
    }

    fn encode_reset(send_id: u16, now: Instant) -> Datagram {
        let repr = Repr {
            packet_type: PacketType::Reset,
            connection_id: send_id,
            timestamp_micros: now.as_wire_timestamp(),
            timestamp_diff_micros: 0,
            window_size: 0,
            seq_nr: 0,
            ack_nr: 0,
            selective_ack: None,
        };
        let mut buf = vec![0u8; repr.buffer_len(0)];
        repr.emit(&mut buf, &[]);
        buf
    }

    /// Build an unsolicited RESET reply to an unknown (endpoint, id) pair
    /// (spec §4.2). A free function because no `Connection` is allocated
    /// for it — the point is not to spend resources on unsolicited
    /// datagrams (spec §9).
    pub fn reset_reply(send_id: u16, now: Instant) -> Datagram {
        Connection::encode_reset(send_id, now)
    }

    fn build_reset(&self, now: Instant) -> Datagram {
        Connection::encode_reset(self.send_id, now)
    }

    /// Route one inbound, already-demultiplexed packet into this stream
    /// (spec §4.2 step 3, §4.4, §4.5, §4.6).
    pub fn on_packet(&mut self, packet: &Packet<&[u8]>, now: Instant) -> Vec<ConnectionEvent> {
        let repr = match Repr::parse(packet) {
            Ok(repr) => repr,
            Err(_) => {
                self.stats.utp_invalid_pkts_in += 1;
                return Vec::new();
            }
        };
        self.stats.utp_packets_in += 1;
        self.last_recv_at = now;
        self.last_remote_timestamp = repr.timestamp_micros;

        let mut events = Vec::new();

        if repr.packet_type == PacketType::Reset {
            let was_connected = matches!(self.state, State::Connected | State::FinSent);
            self.state = State::Reset;
            self.error = Some(if was_connected {
                Error::ConnectionReset
            } else {
                Error::ConnectionRefused
            });
            events.push(ConnectionEvent::Error(self.error.unwrap()));
            events.push(ConnectionEvent::Closed(CloseReason::PeerReset));
            return events;
        }
        if repr.packet_type == PacketType::Syn {
            // A SYN for an already-known id is a stale retransmit of the
            // handshake; nothing new to do.
            return events;
        }

        if self.state == State::SynSent {
            self.state = State::Connected;
            self.outgoing.remove(SeqNumber::new(1));
            self.retransmit_timer.disarm();
            events.push(ConnectionEvent::Connected);
        } else if self.connected_event_pending {
            self.connected_event_pending = false;
            events.push(ConnectionEvent::Connected);
        }

        // --- SACK accounting, releasing acked records from the outgoing
        // buffer (spec §4.5) before folding the result into congestion
        // control, which needs to know how many bytes this ack newly
        // covers (spec §4.6).
        let outcome = self.sack.consume(
            &mut self.outgoing,
            self.send_base,
            SeqNumber::new(repr.ack_nr),
            repr.selective_ack.as_ref(),
        );
        let bytes_acked: u32 = outcome.released.iter().map(|p| p.payload_len as u32).sum();

        // RTT sample from the oldest cleanly-delivered (never retransmitted)
        // record this ack released — skipping retransmitted ones avoids the
        // retransmission ambiguity (Karn's algorithm).
        if let Some(clean) = outcome.released.iter().find(|p| p.resend_count == 0) {
            let rtt_hint = now - clean.send_time;
            self.srtt = Some(self.srtt.map_or(rtt_hint, |s| {
                Duration::from_micros((s.total_micros() * 7 + rtt_hint.total_micros()) / 8)
            }));
            self.retransmit_timer.on_rtt_sample(rtt_hint);
        }

        let sample = self.congestion.on_ack(repr.timestamp_diff_micros, bytes_acked.max(1), now);
        match sample {
            DelaySample::AboveTarget => self.stats.utp_samples_above_target += 1,
            DelaySample::BelowTarget => self.stats.utp_samples_below_target += 1,
        }
        self.peer_window = repr.window_size;

        let ack = SeqNumber::new(repr.ack_nr);
        if ack >= self.send_base.wrapping_sub(1) {
            self.send_base = ack.wrapping_add(1);
        }
        for released in &outcome.released {
            if released.mtu_probe {
                self.mtu.on_probe_acked(released.seq.0, now);
            }
            if Some(released.seq) == self.fin_seq {
                events.push(ConnectionEvent::Closed(CloseReason::FinAcked));
            }
        }
        if !outcome.released.is_empty() {
            events.push(ConnectionEvent::Writable);
        }
        if let Some(gap_seq) = outcome.fast_retransmit {
            if let Some(gap) = self.outgoing.get_mut(gap_seq) {
                if !gap.mtu_probe {
                    gap.need_resend = true;
                    self.stats.utp_fast_retransmit += 1;
                    self.stats.utp_packet_loss += 1;
                    if let Some(rtt) = self.srtt {
                        self.congestion.on_congestion_loss(now, rtt);
                    }
                }
            }
        }
        if self.outgoing.is_empty() {
            self.retransmit_timer.disarm();
        } else {
            self.retransmit_timer.rearm(now);
        }

        // --- reassembly (spec §4.4) ---
        if repr.packet_type == PacketType::Data || repr.packet_type == PacketType::Fin {
            self.stats.utp_payload_pkts_in += 1;
            let seq = SeqNumber::new(repr.seq_nr);
            let expected = self.ack_nr.wrapping_add(1);
            if seq < expected {
                self.stats.utp_redundant_pkts_in += 1;
            } else if seq == expected {
                let payload = packet.payload().unwrap_or(&[]).to_vec();
                let mut delivered = !payload.is_empty();
                if !payload.is_empty() {
                    self.recv_queue.push(&payload);
                }
                self.ack_nr = seq;
                let (more, next) = self.incoming.drain_contiguous(self.ack_nr.wrapping_add(1));
                if !more.is_empty() {
                    self.recv_queue.push(&more);
                    self.ack_nr = next.wrapping_sub(1);
                    delivered = true;
                }
                if delivered {
                    events.push(ConnectionEvent::Readable);
                }
            } else if !self.incoming.insert(seq, packet.payload().unwrap_or(&[]).to_vec()) {
                self.stats.utp_redundant_pkts_in += 1;
            }

            if repr.packet_type == PacketType::Fin {
                self.peer_fin_seq = Some(seq);
            }
        }

        if let Some(fin_seq) = self.peer_fin_seq {
            if self.ack_nr >= fin_seq && !self.recv_queue.is_eof() {
                self.recv_queue.mark_fin();
                events.push(ConnectionEvent::Readable);
            }
        }

        self.maybe_close_after_fin(&mut events);
        events
    }

    fn maybe_close_after_fin(&mut self, events: &mut Vec<ConnectionEvent>) {
        let fin_fully_acked = self.fin_seq.is_some_and(|seq| seq < self.send_base);
        let peer_fin_delivered = self.peer_fin_seq.is_some_and(|seq| self.ack_nr >= seq);
        if self.state == State::FinSent && fin_fully_acked && peer_fin_delivered {
            self.state = State::Closed;
            if !events.contains(&ConnectionEvent::Closed(CloseReason::FinAcked)) {
                events.push(ConnectionEvent::Closed(CloseReason::FinAcked));
            }
        }
    }

    /// Drive timers, packetization, keepalive, and MTU probing (spec §4.3,
    /// §4.7, §4.8, §4.9, §5). Returns datagrams to send and events to
    /// surface to the upper layer.
    pub fn poll(&mut self, now: Instant) -> (Vec<OutboundPacket>, Vec<ConnectionEvent>) {
        let mut datagrams = Vec::new();
        let mut events = Vec::new();

        if self.reset_requested && !self.state.is_terminal() {
            datagrams.push(OutboundPacket {
                seq: None,
                bytes: self.build_reset(now),
            });
            self.state = State::Reset;
            self.outgoing = OutgoingBuffer::new();
            self.retransmit_timer.disarm();
            events.push(ConnectionEvent::Closed(CloseReason::LocalReset));
            return (datagrams, events);
        }
        if self.state.is_terminal() {
            return (datagrams, events);
        }

        self.poll_fast_retransmit(now, &mut datagrams);
        self.poll_retransmit(now, &mut datagrams, &mut events);
        if self.state.is_terminal() {
            return (datagrams, events);
        }
        self.poll_mtu_probe(now, &mut datagrams);
        self.poll_packetize(now, &mut datagrams);
        self.poll_fin(now, &mut datagrams);
        self.poll_keepalive(now, &mut datagrams);

        if !self.send_queue.is_empty() && self.cwnd_headroom() > 0 {
            events.push(ConnectionEvent::Writable);
        }

        (datagrams, events)
    }

    /// Resend anything the SACK engine flagged as lost without waiting for
    /// the retransmit timer (spec §4.5 "fast retransmit").
    fn poll_fast_retransmit(&mut self, now: Instant, datagrams: &mut Vec<OutboundPacket>) {
        let pending: Vec<SeqNumber> = self.outgoing.iter().filter(|p| p.need_resend).map(|p| p.seq).collect();
        for seq in pending {
            let Some(record) = self.outgoing.get(seq).cloned() else {
                continue;
            };
            let packet_type = self.resend_packet_type(seq);
            let payload = self.payload_from_record(&record);
            let bytes = self.encode(packet_type, seq, &payload, now);
            if let Some(slot) = self.outgoing.get_mut(seq) {
                slot.wire_buffer = bytes.clone();
                slot.send_time = now;
                slot.resend_count += 1;
                slot.need_resend = false;
            }
            self.stats.utp_packet_resend += 1;
            datagrams.push(OutboundPacket { seq: Some(seq), bytes });
        }
        if !self.outgoing.is_empty() {
            self.retransmit_timer.rearm(now);
        }
    }

    /// A resend must carry the same packet type the original did: the SYN
    /// and FIN are identified by sequence number, not by any flag on the
    /// stored record, since a handshake SYN re-sent as plain `DATA` carries
    /// the wrong connection id and the peer has no stream to route it to
    /// (spec §3, §4.9).
    fn resend_packet_type(&self, seq: SeqNumber) -> PacketType {
        if Some(seq) == self.fin_seq {
            PacketType::Fin
        } else if seq == SeqNumber::new(1) && self.state == State::SynSent {
            PacketType::Syn
        } else {
            PacketType::Data
        }
    }

    fn poll_retransmit(&mut self, now: Instant, datagrams: &mut Vec<OutboundPacket>, events: &mut Vec<ConnectionEvent>) {
        let outcome = self.retransmit_timer.poll(now);
        if outcome == TimeoutOutcome::NotExpired {
            return;
        }
        let Some(oldest) = self.outgoing.oldest_from(self.send_base).map(|p| p.seq) else {
            self.retransmit_timer.disarm();
            return;
        };

        let is_mtu_probe = self.outgoing.get(oldest).is_some_and(|p| p.mtu_probe);
        let is_fin = Some(oldest) == self.fin_seq;

        if is_mtu_probe {
            self.mtu.on_probe_lost(oldest.0, now);
            self.outgoing.remove(oldest);
            self.retransmit_timer.rearm(now);
            return;
        }

        self.congestion.on_timeout(now);
        self.stats.utp_timeout += 1;

        if is_fin {
            self.fin_resend_count += 1;
            if self.fin_resend_count >= self.config.utp_fin_resends {
                self.state = State::Closed;
                events.push(ConnectionEvent::Closed(CloseReason::FinAcked));
                return;
            }
        } else if outcome == TimeoutOutcome::ExceededResendLimit {
            self.error = Some(Error::TimedOut {
                resends: self.retransmit_timer.consecutive_timeouts(),
            });
            self.state = State::Reset;
            events.push(ConnectionEvent::Error(self.error.unwrap()));
            events.push(ConnectionEvent::Closed(CloseReason::LocalReset));
            return;
        }

        if let Some(record) = self.outgoing.get(oldest).cloned() {
            let packet_type = self.resend_packet_type(oldest);
            let payload = self.payload_from_record(&record);
            let bytes = self.encode(packet_type, oldest, &payload, now);
            if let Some(slot) = self.outgoing.get_mut(oldest) {
                slot.wire_buffer = bytes.clone();
                slot.send_time = now;
                slot.resend_count += 1;
                slot.need_resend = false;
            }
            self.stats.utp_packet_resend += 1;
            datagrams.push(OutboundPacket { seq: Some(oldest), bytes });
        }
        self.retransmit_timer.rearm(now);
    }

    fn payload_from_record(&self, record: &OutgoingPacket) -> Vec<u8> {
        let start = record.wire_buffer.len().saturating_sub(record.payload_len);
        record.wire_buffer[start..].to_vec()
    }

    /// Send one path-MTU probe when due (spec §4.7). Only probes with real
    /// queued application data — padding a probe with filler bytes would
    /// corrupt the byte stream, since µTP has no separate filler packet
    /// type.
    fn poll_mtu_probe(&mut self, now: Instant, datagrams: &mut Vec<OutboundPacket>) {
        if self.state != State::Connected {
            return;
        }
        let Some(probe_size) = self.mtu.poll(now) else {
            return;
        };
        let payload_len = (probe_size as usize).saturating_sub(crate::wire::HEADER_LEN);
        if payload_len == 0 || self.send_queue.len() < payload_len {
            return;
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let chunk = self.send_queue.pop_chunk(payload_len);
        let bytes = self.encode(PacketType::Data, seq, &chunk, now);
        self.outgoing.insert(OutgoingPacket {
            seq,
            wire_buffer: bytes.clone(),
            payload_len: chunk.len(),
            send_time: now,
            resend_count: 0,
            need_resend: false,
            mtu_probe: true,
        });
        self.mtu.mark_sent(seq.0);
        self.stats.utp_packets_out += 1;
        if !self.retransmit_timer.is_armed() {
            self.retransmit_timer.rearm(now);
        }
        datagrams.push(OutboundPacket { seq: Some(seq), bytes });
    }

    fn poll_packetize(&mut self, now: Instant, datagrams: &mut Vec<OutboundPacket>) {
        if !self.state.can_send_data() {
            return;
        }
        loop {
            if self.send_queue.is_empty() {
                break;
            }
            let headroom = self.cwnd_headroom() as usize;
            if headroom == 0 {
                break;
            }
            let mtu = self.effective_mtu();
            let max_payload = mtu.saturating_sub(crate::wire::HEADER_LEN).min(headroom);
            if max_payload == 0 {
                break;
            }
            let chunk = self.send_queue.pop_chunk(max_payload);
            if chunk.is_empty() {
                break;
            }
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            let bytes = self.build_and_store(PacketType::Data, seq, &chunk, now);
            datagrams.push(OutboundPacket { seq: Some(seq), bytes });
            if !self.retransmit_timer.is_armed() {
                self.retransmit_timer.rearm(now);
            }
        }
    }

    fn poll_fin(&mut self, now: Instant, datagrams: &mut Vec<OutboundPacket>) {
        if self.state == State::FinSent && self.fin_seq.is_none() && self.send_queue.is_empty() {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.fin_seq = Some(seq);
            let bytes = self.build_and_store(PacketType::Fin, seq, &[], now);
            datagrams.push(OutboundPacket { seq: Some(seq), bytes });
            if !self.retransmit_timer.is_armed() {
                self.retransmit_timer.rearm(now);
            }
        }
    }

    fn poll_keepalive(&mut self, now: Instant, datagrams: &mut Vec<OutboundPacket>) {
        if self.state != State::Connected {
            return;
        }
        if now - self.last_recv_at >= state::KEEPALIVE_IDLE {
            let bytes = self.build_state_packet(now);
            datagrams.push(OutboundPacket { seq: None, bytes });
            self.last_recv_at = now;
        }
    }

    /// The manager couldn't actually hand this packet to the network this
    /// tick (e.g. a full kernel send buffer) — flag it for an immediate
    /// resend on the next `poll` via the fast-retransmit path, rather than
    /// waiting out the full RTO for a packet that was never actually lost
    /// in flight (spec §5).
    pub fn mark_send_failed(&mut self, seq: SeqNumber) {
        if let Some(record) = self.outgoing.get_mut(seq) {
            record.need_resend = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn connect_emits_syn_and_arms_timer() {
        let (conn, syn) = Connection::connect(Config::default(), addr(), 100, Instant::ZERO);
        let packet = Packet::new_checked(&syn[..]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Syn);
        assert_eq!(conn.state(), State::SynSent);
        assert_eq!(conn.send_id(), 101);
    }

    #[test]
    fn fast_retransmit_resends_syn_as_syn_not_data() {
        let (mut conn, _syn) = Connection::connect(Config::default(), addr(), 100, Instant::ZERO);
        // Simulate the manager flagging the handshake SYN as unsent (e.g. the
        // embedder's socket reported WouldBlock on the original send).
        conn.mark_send_failed(SeqNumber::new(1));
        let (datagrams, _events) = conn.poll(Instant::from_millis(1));
        assert_eq!(datagrams.len(), 1);
        let packet = Packet::new_checked(&datagrams[0].bytes[..]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Syn);
        assert_eq!(packet.connection_id(), conn.recv_id());
    }

    #[test]
    fn accept_replies_with_state_and_marks_connected_pending() {
        let (mut conn, state_pkt) = Connection::accept(Config::default(), addr(), 200, SeqNumber::new(1), Instant::ZERO);
        let packet = Packet::new_checked(&state_pkt[..]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::State);
        assert_eq!(conn.state(), State::Connected);
        assert!(conn.connected_event_pending);
        conn.write(b"hi").unwrap();
        let (_datagrams, events) = conn.poll(Instant::from_millis(1));
        assert!(events.contains(&ConnectionEvent::Connected));
    }

    #[test]
    fn write_then_poll_packetizes_into_data() {
        let (mut conn, _syn) = Connection::connect(Config::default(), addr(), 1, Instant::ZERO);
        conn.state = State::Connected; // pretend the handshake already finished
        conn.write(b"hello world").unwrap();
        let (datagrams, _events) = conn.poll(Instant::from_millis(1));
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].seq, Some(SeqNumber::new(1)));
        let packet = Packet::new_checked(&datagrams[0].bytes[..]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Data);
        assert_eq!(packet.payload().unwrap(), b"hello world");
    }

    #[test]
    fn close_graceful_sends_fin_once_queue_drains() {
        let (mut conn, _syn) = Connection::connect(Config::default(), addr(), 1, Instant::ZERO);
        conn.state = State::Connected;
        conn.close(CloseMode::Graceful);
        let (datagrams, _events) = conn.poll(Instant::from_millis(1));
        assert_eq!(datagrams.len(), 1);
        let packet = Packet::new_checked(&datagrams[0].bytes[..]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Fin);
        assert!(conn.write(b"too late").is_err());
    }

    #[test]
    fn close_graceful_drains_queued_data_before_fin() {
        let (mut conn, _syn) = Connection::connect(Config::default(), addr(), 1, Instant::ZERO);
        conn.state = State::Connected;
        conn.write(b"hello world").unwrap();
        conn.close(CloseMode::Graceful);
        // The FIN has no sequence number yet — it's only assigned once the
        // queue is empty — so the stream must still be willing to packetize
        // the bytes queued before close (spec §4.9 "after whatever is still
        // queued").
        let (datagrams, _events) = conn.poll(Instant::from_millis(1));
        assert_eq!(datagrams.len(), 2, "the queued data and the FIN should both go out");
        let data_packet = Packet::new_checked(&datagrams[0].bytes[..]).unwrap();
        assert_eq!(data_packet.packet_type(), PacketType::Data);
        assert_eq!(data_packet.payload().unwrap(), b"hello world");
        let fin_packet = Packet::new_checked(&datagrams[1].bytes[..]).unwrap();
        assert_eq!(fin_packet.packet_type(), PacketType::Fin);
        assert!(!conn.state().is_terminal());
    }
}
