//! Time sources.
//!
//! Durations are always measured on the monotonic clock; the wall clock is only
//! used for the reported start time of an item and for token expiry.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync + 'static {
    /// Current UTC wall-clock time.
    fn wall(&self) -> DateTime<Utc>;
    /// Current monotonic timestamp.
    fn monotonic(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-driven clock. The two time lines move independently, which lets tests
/// jump the wall clock without touching measured durations.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    elapsed: Duration,
}

impl ManualClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(ManualState {
                wall,
                elapsed: Duration::ZERO,
            }),
        }
    }

    /// Advance both time lines by `d`.
    pub fn advance(&self, d: Duration) {
        let mut s = self.state.lock();
        s.elapsed += d;
        s.wall += chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Move only the wall clock, as an NTP correction or manual change would.
    pub fn skew_wall(&self, delta: chrono::Duration) {
        self.state.lock().wall += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }

    fn monotonic(&self) -> Instant {
        self.base + self.state.lock().elapsed
    }
}
