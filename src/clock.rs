use std::time::{Duration, Instant};

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// The shared monotonic timebase every stage compares timestamps against.
///
/// One clock exists per pipeline graph; capture stamps frames with it, the
/// presentation thread syncs against it, and the frame monitor derives its
/// statistics from it. Time zero is the moment the graph was built.
#[derive(Debug, Clone)]
pub struct PipelineClock {
    base: Instant,
}

impl PipelineClock {
    pub fn new() -> Self {
        PipelineClock {
            base: Instant::now(),
        }
    }

    /// Current pipeline time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }

    /// Park the calling thread until pipeline time reaches `pts`.
    ///
    /// Sleeps coarsely to just short of the deadline, then spins the last
    /// stretch: the OS sleep granularity is far above what a 120 fps
    /// cadence tolerates. Returns immediately when `pts` is already past.
    /// Used only by cadence-driving threads, never by the control loop.
    pub fn wait_until(&self, pts: u64) {
        const SPIN_WINDOW_NS: u64 = 1_500_000;

        loop {
            let now = self.now();
            if now >= pts {
                return;
            }
            let remaining = pts - now;
            if remaining > SPIN_WINDOW_NS {
                std::thread::sleep(Duration::from_nanos(remaining - SPIN_WINDOW_NS));
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Interval in nanoseconds for a `numer/denom` frames-per-second cadence.
    pub fn interval_ns(numer: u32, denom: u32) -> u64 {
        NANOS_PER_SEC * denom.max(1) as u64 / numer.max(1) as u64
    }
}

impl Default for PipelineClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = PipelineClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn intervals_for_pipeline_cadences() {
        assert_eq!(PipelineClock::interval_ns(30, 1), 33_333_333);
        assert_eq!(PipelineClock::interval_ns(120, 1), 8_333_333);
    }

    #[test]
    fn wait_until_past_timestamp_returns_immediately() {
        let clock = PipelineClock::new();
        let start = Instant::now();
        clock.wait_until(0);
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
