//! Path-MTU discovery (spec §4.7).
//!
//! A binary search between a floor (known to get through) and a ceiling
//! (may be too big) converges on the largest packet the path accepts,
//! without ever letting a lost probe look like ordinary congestion.

use crate::time::{Duration, Instant};

/// IPv4 + UDP headroom subtracted from the minimum IP MTU (576) to get the
/// floor every path is assumed to support.
const IP_UDP_HEADROOM: u32 = 28;
const MIN_PATH_MTU: u32 = 576;
const DEFAULT_CEILING: u32 = 1500;
const INITIAL_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct MtuDiscovery {
    floor: u32,
    ceiling: u32,
    probe_interval: Duration,
    next_probe_at: Instant,
    /// Sequence number of the in-flight probe, if any. Only one probe is
    /// outstanding at a time.
    in_flight: Option<u16>,
}

impl MtuDiscovery {
    pub fn new(now: Instant) -> MtuDiscovery {
        MtuDiscovery {
            floor: MIN_PATH_MTU - IP_UDP_HEADROOM,
            ceiling: DEFAULT_CEILING - IP_UDP_HEADROOM,
            probe_interval: INITIAL_PROBE_INTERVAL,
            next_probe_at: now + INITIAL_PROBE_INTERVAL,
            in_flight: None,
        }
    }

    /// The packet-size ceiling ordinary (non-probe) packets must respect.
    pub fn effective_mtu(&self) -> u32 {
        self.floor
    }

    pub fn is_probing(&self) -> bool {
        self.in_flight.is_some()
    }

    fn probe_size(&self) -> u32 {
        (self.floor + self.ceiling + 1) / 2
    }

    /// Should a probe be sent now, and at what size? Only ever one probe
    /// outstanding; the ceiling and floor must still be a packet size
    /// apart or there's nothing left to discover.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        if self.in_flight.is_some() || now < self.next_probe_at {
            return None;
        }
        if self.ceiling <= self.floor + 1 {
            // Converged; back off further rather than probing every tick.
            self.next_probe_at = now + MAX_PROBE_INTERVAL;
            return None;
        }
        Some(self.probe_size())
    }

    pub fn mark_sent(&mut self, seq: u16) {
        self.in_flight = Some(seq);
    }

    /// The probe was acked: the floor can move up to the probed size.
    /// Confirmed MTUs back off the next probe exponentially (spec §4.7).
    pub fn on_probe_acked(&mut self, seq: u16, now: Instant) {
        if self.in_flight != Some(seq) {
            return;
        }
        self.floor = self.probe_size();
        self.in_flight = None;
        self.probe_interval = (self.probe_interval * 2).min(MAX_PROBE_INTERVAL);
        self.next_probe_at = now + self.probe_interval;
    }

    /// The probe was lost: shrink the ceiling and try again promptly,
    /// without attributing the loss to congestion (spec §4.7, §4.8).
    pub fn on_probe_lost(&mut self, seq: u16, now: Instant) {
        if self.in_flight != Some(seq) {
            return;
        }
        let probed = self.probe_size();
        self.ceiling = probed.saturating_sub(1).max(self.floor);
        self.in_flight = None;
        self.next_probe_at = now;
    }
}
