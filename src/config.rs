//! Configuration (spec §6) — a closed set of tunables, each with the
//! default the spec calls out.

use crate::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Kernel UDP send-socket buffer size hint, in bytes.
    pub send_socket_buffer_size: usize,
    /// LEDBAT target queueing delay.
    pub utp_target_delay_ms: u32,
    /// Max cwnd growth per RTT, in bytes (`max_cwnd_increase_per_rtt`).
    pub utp_gain: u32,
    pub utp_min_timeout_ms: u32,
    pub utp_max_timeout_ms: u32,
    pub utp_connect_timeout_ms: u32,
    /// Max FIN retransmissions before a graceful close is forced anyway.
    pub utp_fin_resends: u32,
    /// Max consecutive retransmit timeouts before the stream errors out.
    pub utp_num_resends: u32,
    /// cwnd multiplier applied on a congestion-loss event (default 0.5).
    pub utp_loss_multiplier: f64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            send_socket_buffer_size: 1 << 20,
            utp_target_delay_ms: 100,
            utp_gain: 3000,
            utp_min_timeout_ms: 500,
            utp_max_timeout_ms: 60_000,
            utp_connect_timeout_ms: 3_000,
            utp_fin_resends: 4,
            utp_num_resends: 5,
            utp_loss_multiplier: 0.5,
        }
    }
}

impl Config {
    pub fn target_delay(&self) -> Duration {
        Duration::from_millis(self.utp_target_delay_ms as i64)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.utp_min_timeout_ms as i64)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.utp_max_timeout_ms as i64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.utp_connect_timeout_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.utp_target_delay_ms, 100);
        assert_eq!(cfg.utp_loss_multiplier, 0.5);
        assert_eq!(cfg.target_delay(), Duration::from_millis(100));
    }
}
