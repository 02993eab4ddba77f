// ABOUTME: Server-side monotonic clocks
// ABOUTME: Real clock for the reactor and a manually advanced one for deterministic runs

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Source of "now" in microseconds
pub trait Clock {
    /// Current time in microseconds from an arbitrary fixed origin
    fn now_micros(&self) -> i64;
}

/// Server clock for generating timestamps
///
/// The server uses a monotonic clock starting from when the server was created.
/// All timestamps are in microseconds from this start point.
#[derive(Debug)]
pub struct ServerClock {
    /// When the server started
    start: Instant,
}

impl ServerClock {
    /// Create a new server clock starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for ServerClock {
    #[inline]
    fn now_micros(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a manual clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance_micros(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::Relaxed);
    }

    /// Move the clock forward by whole milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance_micros(ms as i64 * 1000);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}
