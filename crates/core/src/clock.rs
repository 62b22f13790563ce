// SPDX-License-Identifier: MIT

//! Clock abstraction for testable time handling.
//!
//! The scheduler's minute-tick loop and the dispatcher's timeout/ack logic
//! both need a notion of "now" that a test can move forward deterministically
//! instead of sleeping in wall-clock time.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn epoch_ms(&self) -> u64;

    /// Current UTC time, derived from `epoch_ms`.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.epoch_ms() as i64).unwrap_or_else(Utc::now)
    }
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Fake clock for deterministic scheduler/dispatcher tests.
#[derive(Clone)]
pub struct FakeClock {
    epoch_ms: Arc<Mutex<u64>>,
}

impl FakeClock {
    pub fn new(start_epoch_ms: u64) -> Self {
        Self {
            epoch_ms: Arc::new(Mutex::new(start_epoch_ms)),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        *self.epoch_ms.lock() += delta_ms;
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs * 1000);
    }

    pub fn set_epoch_ms(&self, epoch_ms: u64) {
        *self.epoch_ms.lock() = epoch_ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z, a clean minute boundary for scheduler tests.
        Self::new(1_704_067_200_000)
    }
}

impl Clock for FakeClock {
    fn epoch_ms(&self) -> u64 {
        *self.epoch_ms.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new(0);
        clock.advance_secs(60);
        assert_eq!(clock.epoch_ms(), 60_000);
    }

    #[test]
    fn fake_clock_now_utc_tracks_epoch() {
        let clock = FakeClock::new(0);
        clock.advance_secs(3600);
        assert_eq!(clock.now_utc().timestamp(), 3600);
    }
}
