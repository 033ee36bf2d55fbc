//! Simple stopwatch for measuring elapsed time.

use std::time::Instant;

/// A lightweight stopwatch that measures elapsed time in microseconds.
///
/// Returns `u32::MAX` if the elapsed time exceeds ~71 minutes, which is
/// acceptable for typical request timing where such durations indicate
/// a problem anyway.
pub struct Watch {
    start: Instant,
}

impl Watch {
    /// Starts a new stopwatch.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time in microseconds since the watch was started.
    pub fn elapsed_us(&self) -> u32 {
        u32::try_from(self.start.elapsed().as_micros()).unwrap_or(u32::MAX)
    }

    /// Returns the elapsed time in whole milliseconds, as logged in the
    /// per-request completion line.
    pub fn elapsed_ms(&self) -> u32 {
        self.elapsed_us() / 1_000
    }
}
