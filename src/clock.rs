//! Per-node write timestamp source.
//!
//! Timestamps are wall-clock milliseconds, assigned once at the coordinator
//! that accepts the external request. The atomic guard makes consecutive
//! reads strictly increasing on one node even when the wall clock stalls
//! within a millisecond or steps backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct WallClock {
    last_ms: AtomicU64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current timestamp in milliseconds, strictly greater than any value
    /// previously returned by this instance.
    pub fn now_ms(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut prev = self.last_ms.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self.last_ms.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let clock = WallClock::new();
        let mut last = 0;
        for _ in 0..1_000 {
            let ts = clock.now_ms();
            assert!(ts > last, "timestamp {ts} must exceed {last}");
            last = ts;
        }
    }

    #[test]
    fn tracks_wall_clock() {
        let clock = WallClock::new();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("epoch")
            .as_millis() as u64;
        let ts = clock.now_ms();
        assert!(ts + 1_000 > wall, "clock should stay near wall time");
    }
}
