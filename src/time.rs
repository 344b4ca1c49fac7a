//! Monotonic time primitives.
//!
//! µTP timestamps are 32-bit microsecond counters that wrap every ~71
//! minutes; [`Instant`] stores a full `i64` so arithmetic never wraps inside
//! the crate, and wraps only at the wire boundary (see [`Instant::as_micros_lossy`]).

use core::fmt;
use core::ops;

/// A monotonic point in time, in microseconds since an arbitrary epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    micros: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant { micros: 0 };

    pub const fn from_micros(micros: i64) -> Instant {
        Instant { micros }
    }

    pub const fn from_millis(millis: i64) -> Instant {
        Instant {
            micros: millis * 1000,
        }
    }

    pub const fn from_secs(secs: i64) -> Instant {
        Instant {
            micros: secs * 1_000_000,
        }
    }

    pub const fn total_micros(&self) -> i64 {
        self.micros
    }

    /// Truncate to the 32-bit wire representation used by the packet header.
    pub fn as_wire_timestamp(&self) -> u32 {
        self.micros as u32
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}s", self.micros / 1_000_000, self.micros % 1_000_000)
    }
}

/// A span of time, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    micros: i64,
}

impl Duration {
    pub const ZERO: Duration = Duration { micros: 0 };

    pub const fn from_micros(micros: i64) -> Duration {
        Duration { micros }
    }

    pub const fn from_millis(millis: i64) -> Duration {
        Duration {
            micros: millis * 1000,
        }
    }

    pub const fn from_secs(secs: i64) -> Duration {
        Duration {
            micros: secs * 1_000_000,
        }
    }

    pub const fn total_micros(&self) -> i64 {
        self.micros
    }

    pub const fn total_millis(&self) -> i64 {
        self.micros / 1000
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant::from_micros(self.micros + rhs.micros)
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_micros(self.micros - rhs.micros)
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_micros(self.micros - rhs.micros)
    }
}

impl ops::Mul<u32> for Duration {
    type Output = Duration;
    fn mul(self, rhs: u32) -> Duration {
        Duration::from_micros(self.micros * rhs as i64)
    }
}

/// Source of monotonic time for a socket manager's event loop.
///
/// The embedder supplies this; the transport never calls into the OS clock
/// directly so that simulation tests can drive time deterministically.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// A [`Clock`] whose value is advanced explicitly, for tests and simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualClock {
    now: Instant,
}

impl VirtualClock {
    pub fn new() -> VirtualClock {
        VirtualClock { now: Instant::ZERO }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now = self.now + by;
    }

    pub fn set(&mut self, at: Instant) {
        self.now = at;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.now
    }
}
