/*! The socket manager (spec §4.2, §5): demultiplexes inbound datagrams to
[`Connection`]s by `(remote endpoint, connection id)`, and drives every
open stream's [`Connection::poll`] once per event-loop tick.

Mirrors the teacher's own `Interface::poll` split: nothing here touches a
real socket directly — a [`UdpSocket`] and a [`Clock`] are supplied by the
embedder, so the whole manager can be driven deterministically in tests.
*/

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use log::{debug, trace, warn};

use crate::config::Config;
use crate::socket::{CloseMode, Connection, ConnectionEvent};
use crate::stats::Counters;
use crate::time::{Clock, Instant};
use crate::wire::{Packet, PacketType, SeqNumber, HEADER_LEN};

/// A non-blocking UDP datagram socket, supplied by the embedder. A real
/// implementation wraps `std::net::UdpSocket` or an async equivalent; tests
/// use an in-memory double (spec §5 "UDP is an abstract collaborator").
pub trait UdpSocket {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Non-blocking receive: `Ok(None)` means no datagram is currently
    /// queued, not an error.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Identifies one stream in the manager's demux table: the remote endpoint
/// plus the connection id we listen on (spec §3, §4.2).
pub type ConnectionId = (SocketAddr, u16);

/// One event surfaced from [`Manager::poll`], tagged with which stream it
/// came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub id: ConnectionId,
    pub event: ConnectionEvent,
}

/// Owns every open [`Connection`] for one UDP socket and drives them
/// (spec §4.2, §5, §9).
pub struct Manager {
    config: Config,
    connections: HashMap<ConnectionId, Connection>,
    next_id: u16,
}

impl Manager {
    pub fn new(config: Config) -> Manager {
        Manager {
            config,
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Seed the local id counter explicitly (e.g. from a CSPRNG at
    /// startup). Picking the next candidate is still the manager's job —
    /// see [`Manager::connect`] — this only changes where it starts.
    pub fn seed_id(&mut self, seed: u16) {
        self.next_id = seed;
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn close(&mut self, id: ConnectionId, mode: CloseMode) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.close(mode);
        }
    }

    /// Pick a `recv_id` not already used by this remote, then hand off to
    /// [`Connection::connect`] and remember it in the demux table. Spec §9:
    /// an id must be proven unique before it's allocated to a stream — here
    /// that means proven unique in our own table, since a collision with
    /// another local stream talking to the same remote would misroute every
    /// packet that follows.
    pub fn connect(&mut self, socket: &mut dyn UdpSocket, clock: &dyn Clock, remote: SocketAddr) -> io::Result<ConnectionId> {
        let now = clock.now();
        let recv_id = self.allocate_id(remote);
        let (mut conn, syn) = Connection::connect(self.config, remote, recv_id, now);
        if !send_best_effort(socket, &syn, remote)? {
            conn.mark_send_failed(SeqNumber::new(1));
        }
        let id = (remote, recv_id);
        self.connections.insert(id, conn);
        debug!("utp: connect {} recv_id={}", remote, recv_id);
        Ok(id)
    }

    fn allocate_id(&mut self, remote: SocketAddr) -> u16 {
        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(2);
            if !self.connections.contains_key(&(remote, candidate)) {
                return candidate;
            }
        }
    }

    /// Drain every datagram currently queued on `socket`, dispatch it, then
    /// drive every connection's timers and packetizer once (spec §4.2,
    /// §4.3, §5). Returns every event raised this tick, and every datagram
    /// the connections produced has already been sent.
    pub fn poll(&mut self, socket: &mut dyn UdpSocket, clock: &dyn Clock) -> io::Result<Vec<Notification>> {
        let now = clock.now();
        let mut notifications = Vec::new();
        self.receive_all(socket, now, &mut notifications)?;
        self.drive_all(socket, now, &mut notifications)?;
        self.reap_terminal();
        Ok(notifications)
    }

    fn receive_all(&mut self, socket: &mut dyn UdpSocket, now: Instant, out: &mut Vec<Notification>) -> io::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let Some((len, remote)) = socket.recv_from(&mut buf)? else {
                return Ok(());
            };
            self.dispatch(socket, &buf[..len], remote, now, out)?;
        }
    }

    /// spec §4.2: drop anything under the fixed header size; route known
    /// `(remote, connection_id)` pairs to their stream; start a new stream
    /// for an unmatched SYN; RESET anything else.
    fn dispatch(
        &mut self,
        socket: &mut dyn UdpSocket,
        datagram: &[u8],
        remote: SocketAddr,
        now: Instant,
        out: &mut Vec<Notification>,
    ) -> io::Result<()> {
        if datagram.len() < HEADER_LEN {
            trace!("utp: dropping undersized datagram from {}", remote);
            return Ok(());
        }
        let Ok(packet) = Packet::new_checked(datagram) else {
            trace!("utp: dropping malformed datagram from {}", remote);
            return Ok(());
        };
        let id = (remote, packet.connection_id());

        if let Some(conn) = self.connections.get_mut(&id) {
            // Any reply this warrants (an ack, a window update) goes out in
            // drive_all's poll() pass later this tick, once every queued
            // datagram has been dispatched.
            let events = conn.on_packet(&packet, now);
            out.extend(events.into_iter().map(|event| Notification { id, event }));
            return Ok(());
        }

        if packet.packet_type() == PacketType::Syn {
            let recv_id = packet.connection_id().wrapping_add(1);
            if self.connections.contains_key(&(remote, recv_id)) {
                // Never overwrite a live stream (spec §9).
                return Ok(());
            }
            let (mut conn, state_pkt) =
                Connection::accept(self.config, remote, recv_id, SeqNumber::new(packet.seq_nr()), now);
            send_best_effort(socket, &state_pkt, remote)?;
            let new_id = (remote, recv_id);
            debug!("utp: accepted {} recv_id={}", remote, recv_id);
            out.push(Notification {
                id: new_id,
                event: ConnectionEvent::Connected,
            });
            conn.clear_connected_pending();
            self.connections.insert(new_id, conn);
            return Ok(());
        }

        warn!("utp: no stream for {} id={}, sending reset", remote, packet.connection_id());
        let reset = Connection::reset_reply(packet.connection_id(), now);
        send_best_effort(socket, &reset, remote)?;
        Ok(())
    }

    fn drive_all(&mut self, socket: &mut dyn UdpSocket, now: Instant, out: &mut Vec<Notification>) -> io::Result<()> {
        for (&id, conn) in self.connections.iter_mut() {
            let (packets, events) = conn.poll(now);
            for packet in packets {
                if !send_best_effort(socket, &packet.bytes, id.0)? {
                    if let Some(seq) = packet.seq {
                        conn.mark_send_failed(seq);
                    }
                }
            }
            out.extend(events.into_iter().map(|event| Notification { id, event }));
        }
        Ok(())
    }

    /// Reclaim streams that have reached a terminal state and have nothing
    /// left in flight (spec §3 lifecycle).
    fn reap_terminal(&mut self) {
        self.connections.retain(|_, conn| !conn.state().is_terminal());
    }

    /// Sum every open stream's counters into one snapshot (spec §6).
    pub fn stats(&self) -> Counters {
        let mut totals = Counters::default();
        for conn in self.connections.values() {
            totals.merge(conn.stats());
        }
        totals
    }
}

/// UDP send and recv are non-blocking (spec §5): a full kernel send buffer
/// reports `WouldBlock`, which is not a stream error. Returns `Ok(true)` if
/// the datagram actually went out, `Ok(false)` if it was silently dropped
/// because the socket would have blocked — callers that can identify which
/// outgoing sequence number a dropped datagram carried should flag it via
/// [`Connection::mark_send_failed`] instead of waiting for a full timeout.
fn send_best_effort(socket: &mut dyn UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<bool> {
    match socket.send_to(buf, addr) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            trace!("utp: send to {} would block, dropping this datagram", addr);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}
