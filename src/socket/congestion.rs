//! LEDBAT delay-based congestion control (spec §4.6).
//!
//! One-way delay is estimated from the header's `timestamp_diff` field
//! rather than from RTT, which is what lets LEDBAT target a fixed queueing
//! delay and yield to competing TCP flows instead of fighting them for the
//! last slot in the bottleneck queue.

use crate::config::Config;
use crate::time::{Duration, Instant};

/// Width of the sliding window the delay-base minimum is computed over.
/// Spec §4.6 calls out "typically 2 minutes".
const DELAY_WINDOW: Duration = Duration::from_secs(120);

/// Default maximum segment size used to derive `min_cwnd = 2 * MSS`
/// (spec §4.6) absent a confirmed path MTU (spec §4.7 starts the ceiling at
/// 1500 minus headers, which this approximates before the first probe).
pub const DEFAULT_MSS: u32 = 1400;

/// A sliding-window minimum, implemented as two buckets rotated every
/// `window / 2` (spec §9: "avoid per-sample sorting"). At any instant the
/// reported minimum covers at least the last `window / 2` and at most the
/// last `window` of samples.
#[derive(Debug, Clone, Copy)]
struct DelayBase {
    window: Duration,
    current: Option<u32>,
    next: Option<u32>,
    bucket_started: Instant,
}

impl DelayBase {
    fn new(window: Duration) -> DelayBase {
        DelayBase {
            window,
            current: None,
            next: None,
            bucket_started: Instant::ZERO,
        }
    }

    fn sample(&mut self, value: u32, now: Instant) -> u32 {
        self.current = Some(self.current.map_or(value, |m| m.min(value)));
        self.next = Some(self.next.map_or(value, |m| m.min(value)));

        if now - self.bucket_started >= Duration::from_micros(self.window.total_micros() / 2) {
            self.current = self.next;
            self.next = None;
            self.bucket_started = now;
        }

        self.current.unwrap_or(value)
    }
}

/// Outcome of folding one ack's delay sample into the controller, for the
/// caller to update `utp_samples_above_target` / `utp_samples_below_target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySample {
    AboveTarget,
    BelowTarget,
}

#[derive(Debug)]
pub struct Congestion {
    cwnd: f64,
    min_cwnd: f64,
    max_cwnd: f64,
    target_delay: Duration,
    gain: f64,
    our_delay_base: DelayBase,
    their_delay_base: DelayBase,
    slow_start: bool,
    loss_multiplier: f64,
    last_loss_reduction: Option<Instant>,
    last_timeout_reduction: Option<Instant>,
}

impl Congestion {
    pub fn new(config: &Config) -> Congestion {
        let mss = DEFAULT_MSS as f64;
        Congestion {
            cwnd: mss * 2.0,
            min_cwnd: mss * 2.0,
            max_cwnd: 4.0 * 1024.0 * 1024.0,
            target_delay: config.target_delay(),
            gain: config.utp_gain as f64,
            our_delay_base: DelayBase::new(DELAY_WINDOW),
            their_delay_base: DelayBase::new(DELAY_WINDOW),
            slow_start: true,
            loss_multiplier: config.utp_loss_multiplier,
            last_loss_reduction: None,
            last_timeout_reduction: None,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd as u32
    }

    /// Feed the peer-reported delay (the incoming packet's `timestamp_diff`
    /// field) and the bytes this ack newly covers into the controller
    /// (spec §4.6). Returns which side of `target_delay` the sample fell on.
    pub fn on_ack(
        &mut self,
        peer_timestamp_diff: u32,
        bytes_acked: u32,
        now: Instant,
    ) -> DelaySample {
        let base = self.our_delay_base.sample(peer_timestamp_diff, now);
        let current_delay = peer_timestamp_diff.saturating_sub(base) as i64;
        let target = self.target_delay.total_micros().max(1);

        let sample = if current_delay > target {
            self.slow_start = false;
            DelaySample::AboveTarget
        } else {
            DelaySample::BelowTarget
        };

        if self.slow_start {
            // Spec §4.6: while no loss has been observed and delay is well
            // below target, cwnd grows by bytes_acked per ack.
            self.cwnd += bytes_acked as f64;
        } else {
            let off_target = (target - current_delay) as f64 / target as f64;
            let gain = self.gain * off_target * bytes_acked as f64 / self.cwnd.max(1.0);
            self.cwnd += gain;
        }
        self.clamp_cwnd();
        sample
    }

    /// Bookkeeping for the symmetric, peer-side delay base (spec §4.6):
    /// the one-way delay *we* measured for the peer's packets, which is
    /// what we in turn advertise in our own outgoing `timestamp_diff` field.
    pub fn observe_their_delay(&mut self, measured_delay: u32, now: Instant) -> u32 {
        self.their_delay_base.sample(measured_delay, now)
    }

    /// Retransmit-timeout: halve cwnd, floor at `min_cwnd` (spec §4.6, §4.8).
    /// Ends slow start.
    pub fn on_timeout(&mut self, now: Instant) {
        self.slow_start = false;
        self.cwnd /= 2.0;
        self.clamp_cwnd();
        self.last_timeout_reduction = Some(now);
    }

    /// Congestion loss (not fast-retransmit, not an MTU probe): reduce cwnd
    /// at most once per RTT window (spec §4.6, §4.8).
    pub fn on_congestion_loss(&mut self, now: Instant, rtt: Duration) {
        self.slow_start = false;
        if let Some(last) = self.last_loss_reduction {
            if now - last < rtt {
                return;
            }
        }
        self.cwnd *= self.loss_multiplier;
        self.clamp_cwnd();
        self.last_loss_reduction = Some(now);
    }

    fn clamp_cwnd(&mut self) {
        self.cwnd = self.cwnd.clamp(self.min_cwnd, self.max_cwnd);
    }

    pub fn is_slow_start(&self) -> bool {
        self.slow_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cwnd_never_leaves_bounds() {
        let config = Config::default();
        let mut cc = Congestion::new(&config);
        let mut now = Instant::ZERO;
        for _ in 0..1000 {
            cc.on_ack(5_000, 1500, now);
            now = now + Duration::from_millis(20);
            assert!(cc.cwnd() >= cc.min_cwnd as u32);
            assert!(cc.cwnd() <= cc.max_cwnd as u32);
        }
    }

    #[test]
    fn timeout_halves_cwnd_but_not_below_min() {
        let config = Config::default();
        let mut cc = Congestion::new(&config);
        cc.cwnd = 10_000.0;
        cc.on_timeout(Instant::ZERO);
        assert_eq!(cc.cwnd(), 5000);
        cc.cwnd = cc.min_cwnd + 1.0;
        cc.on_timeout(Instant::ZERO);
        assert_eq!(cc.cwnd(), cc.min_cwnd as u32);
    }

    #[test]
    fn loss_reduction_is_rate_limited_per_rtt() {
        let config = Config::default();
        let mut cc = Congestion::new(&config);
        cc.cwnd = 100_000.0;
        let rtt = Duration::from_millis(100);
        cc.on_congestion_loss(Instant::ZERO, rtt);
        let after_first = cc.cwnd();
        cc.on_congestion_loss(Instant::from_millis(10), rtt);
        assert_eq!(cc.cwnd(), after_first, "second cut within the RTT window must be a no-op");
        cc.on_congestion_loss(Instant::from_millis(200), rtt);
        assert!(cc.cwnd() < after_first);
    }

    #[test]
    fn low_delay_grows_cwnd_in_slow_start() {
        let config = Config::default();
        let mut cc = Congestion::new(&config);
        let before = cc.cwnd();
        let sample = cc.on_ack(0, 1500, Instant::ZERO);
        assert_eq!(sample, DelaySample::BelowTarget);
        assert!(cc.cwnd() > before);
    }
}
