//! The retransmit timer (spec §4.8). Fast-retransmit (spec §4.5) is driven
//! from the SACK engine instead — this module only owns the timeout path,
//! though both rearm the same timer after they send.

use crate::config::Config;
use crate::time::{Duration, Instant};

#[derive(Debug)]
pub struct RetransmitTimer {
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    max_consecutive: u32,
    expires_at: Option<Instant>,
    consecutive_timeouts: u32,
}

/// What happened when the timer was polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// No timer armed, or it hasn't expired yet.
    NotExpired,
    /// Expired; the oldest unacked packet should be retransmitted.
    Expired,
    /// Expired for the `utp_num_resends`th consecutive time: the stream is
    /// now an error (spec §4.8, §7).
    ExceededResendLimit,
}

impl RetransmitTimer {
    pub fn new(config: &Config) -> RetransmitTimer {
        RetransmitTimer {
            rto: config.min_timeout(),
            min_rto: config.min_timeout(),
            max_rto: config.max_timeout(),
            max_consecutive: config.utp_num_resends,
            expires_at: None,
            consecutive_timeouts: 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.expires_at.is_some()
    }

    /// (Re-)arm the timer relative to `now`, per spec §4.3/§4.8: every send
    /// — original or retransmit, timeout-driven or fast-retransmit-driven —
    /// rearms it.
    pub fn rearm(&mut self, now: Instant) {
        self.expires_at = Some(now + self.rto);
    }

    pub fn disarm(&mut self) {
        self.expires_at = None;
        self.consecutive_timeouts = 0;
        self.rto = self.min_rto;
    }

    /// Update the RTO estimate from a fresh RTT sample (simple
    /// proportional backoff reset, matching the smoothing the teacher's own
    /// `RttEstimator` applies on the TCP side: a good ack shrinks the timer
    /// back toward `min_rto` rather than leaving it inflated from a
    /// previous run of timeouts).
    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        self.consecutive_timeouts = 0;
        let candidate = Duration::from_micros(rtt.total_micros() * 2);
        self.rto = candidate.clamp(self.min_rto, self.max_rto);
    }

    pub fn poll(&mut self, now: Instant) -> TimeoutOutcome {
        match self.expires_at {
            Some(expires_at) if now >= expires_at => {
                self.consecutive_timeouts += 1;
                self.rto = (self.rto * 2).min(self.max_rto);
                if self.consecutive_timeouts >= self.max_consecutive {
                    TimeoutOutcome::ExceededResendLimit
                } else {
                    TimeoutOutcome::Expired
                }
            }
            _ => TimeoutOutcome::NotExpired,
        }
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_on_each_timeout_bounded_at_max() {
        let mut config = Config::default();
        config.utp_max_timeout_ms = 2000;
        config.utp_min_timeout_ms = 500;
        config.utp_num_resends = 10;
        let mut timer = RetransmitTimer::new(&config);
        let mut now = Instant::ZERO;
        timer.rearm(now);

        now = now + Duration::from_millis(500);
        assert_eq!(timer.poll(now), TimeoutOutcome::Expired);
        assert_eq!(timer.rto, Duration::from_millis(1000));

        timer.rearm(now);
        now = now + Duration::from_millis(1000);
        assert_eq!(timer.poll(now), TimeoutOutcome::Expired);
        assert_eq!(timer.rto, Duration::from_millis(2000));

        timer.rearm(now);
        now = now + Duration::from_millis(2000);
        assert_eq!(timer.poll(now), TimeoutOutcome::Expired);
        assert_eq!(timer.rto, Duration::from_millis(2000), "capped at max_rto");
    }

    #[test]
    fn exceeds_resend_limit_after_configured_count() {
        let mut config = Config::default();
        config.utp_num_resends = 2;
        let mut timer = RetransmitTimer::new(&config);
        let mut now = Instant::ZERO;

        timer.rearm(now);
        now = now + timer.rto;
        assert_eq!(timer.poll(now), TimeoutOutcome::Expired);

        timer.rearm(now);
        now = now + timer.rto;
        assert_eq!(timer.poll(now), TimeoutOutcome::ExceededResendLimit);
    }
}
