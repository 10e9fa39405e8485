use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::clock::NANOS_PER_SEC;

/// Verdict on the measured render cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpsVerdict {
    Valid,
    Low,
    High,
    Unstable,
    InsufficientData,
}

/// Statistics derived from the monitor window.
#[derive(Debug, Clone, Copy, Default)]
pub struct FpsStats {
    pub current_fps: f64,
    pub avg_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub stddev_fps: f64,
    pub samples: usize,
    pub drops: u64,
}

struct MonitorWindow {
    timestamps: VecDeque<u64>,
    drops: u64,
    total_rendered: u64,
}

/// Measures the actual presentation cadence from the renderer's per-frame
/// probe and turns it into drop counts and a validation verdict.
///
/// `on_rendered` is called exactly once per presented frame, from the
/// presentation thread; everything else reads a snapshot. The window is
/// preallocated so no allocation happens under the lock.
pub struct FrameMonitor {
    target_fps: f64,
    tolerance: f64,
    expected_interval_ns: u64,
    window_size: usize,
    window: Mutex<MonitorWindow>,
}

/// Minimum samples before a Valid verdict is possible.
const MIN_SAMPLES: usize = 30;

/// A gap beyond this multiple of the expected interval implies drops.
const DROP_GAP_FACTOR: f64 = 1.5;

impl FrameMonitor {
    pub fn new(target_fps: u32, tolerance: f64, window_size: usize) -> Self {
        FrameMonitor {
            target_fps: target_fps as f64,
            tolerance,
            expected_interval_ns: NANOS_PER_SEC / target_fps.max(1) as u64,
            window_size: window_size.max(2),
            window: Mutex::new(MonitorWindow {
                timestamps: VecDeque::with_capacity(window_size + 1),
                drops: 0,
                total_rendered: 0,
            }),
        }
    }

    /// Record one presented frame at pipeline time `ts`.
    pub fn on_rendered(&self, ts: u64) {
        let mut missed = 0u64;

        {
            let mut window = self.window.lock();
            if let Some(&last) = window.timestamps.back() {
                let delta = ts.saturating_sub(last);
                let threshold =
                    (self.expected_interval_ns as f64 * DROP_GAP_FACTOR) as u64;
                if delta > threshold {
                    missed = (delta / self.expected_interval_ns).saturating_sub(1);
                    window.drops += missed;
                }
            }

            if window.timestamps.len() == self.window_size {
                window.timestamps.pop_front();
            }
            window.timestamps.push_back(ts);
            window.total_rendered += 1;
        }

        if missed > 0 {
            warn!(missed, ts, "frame drop inferred from render gap");
        }
    }

    pub fn stats(&self) -> FpsStats {
        let window = self.window.lock();
        let n = window.timestamps.len();
        if n < 2 {
            return FpsStats {
                samples: n,
                drops: window.drops,
                ..FpsStats::default()
            };
        }

        let first = window.timestamps.front().copied().unwrap_or(0);
        let last = window.timestamps.back().copied().unwrap_or(first);
        let span = last.saturating_sub(first).max(1);
        let avg_fps = (n as f64 - 1.0) * NANOS_PER_SEC as f64 / span as f64;

        let mut min_fps = f64::INFINITY;
        let mut max_fps: f64 = 0.0;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut current_fps = 0.0;
        let mut prev: Option<u64> = None;
        for &ts in window.timestamps.iter() {
            if let Some(p) = prev {
                let delta = ts.saturating_sub(p).max(1);
                let fps = NANOS_PER_SEC as f64 / delta as f64;
                min_fps = min_fps.min(fps);
                max_fps = max_fps.max(fps);
                sum += fps;
                sum_sq += fps * fps;
                current_fps = fps;
            }
            prev = Some(ts);
        }
        let pairs = (n - 1) as f64;
        let mean = sum / pairs;
        let variance = (sum_sq / pairs - mean * mean).max(0.0);

        FpsStats {
            current_fps,
            avg_fps,
            min_fps,
            max_fps,
            stddev_fps: variance.sqrt(),
            samples: n,
            drops: window.drops,
        }
    }

    /// Validate the measured cadence against the target.
    pub fn verdict(&self) -> FpsVerdict {
        let stats = self.stats();
        if stats.samples < 2 {
            return FpsVerdict::InsufficientData;
        }

        let target = self.target_fps;
        let stddev_limit = target * 0.10;
        let in_range = (stats.avg_fps - target).abs() <= self.tolerance;

        if in_range && stats.stddev_fps <= stddev_limit && stats.samples >= MIN_SAMPLES {
            FpsVerdict::Valid
        } else if stats.avg_fps < target - self.tolerance {
            FpsVerdict::Low
        } else if stats.avg_fps > target + self.tolerance {
            FpsVerdict::High
        } else if in_range && stats.stddev_fps > stddev_limit {
            FpsVerdict::Unstable
        } else {
            FpsVerdict::InsufficientData
        }
    }

    /// Frames presented since startup (not windowed).
    pub fn total_rendered(&self) -> u64 {
        self.window.lock().total_rendered
    }

    pub fn drop_count(&self) -> u64 {
        self.window.lock().drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E: u64 = 8_333_333; // 120 fps interval

    fn feed_steady(monitor: &FrameMonitor, frames: usize, interval: u64) {
        for i in 0..frames {
            monitor.on_rendered(i as u64 * interval);
        }
    }

    #[test]
    fn steady_cadence_validates() {
        let monitor = FrameMonitor::new(120, 2.0, 300);
        feed_steady(&monitor, 60, E);

        let stats = monitor.stats();
        assert!((stats.avg_fps - 120.0).abs() < 0.1, "avg {}", stats.avg_fps);
        assert!(stats.stddev_fps < 1.0);
        assert_eq!(stats.drops, 0);
        assert_eq!(monitor.verdict(), FpsVerdict::Valid);
    }

    #[test]
    fn too_few_samples_is_insufficient() {
        let monitor = FrameMonitor::new(120, 2.0, 300);
        feed_steady(&monitor, 10, E);
        assert_eq!(monitor.verdict(), FpsVerdict::InsufficientData);
    }

    #[test]
    fn slow_cadence_is_low() {
        let monitor = FrameMonitor::new(120, 2.0, 300);
        // 100 fps: below 118.
        feed_steady(&monitor, 60, 10_000_000);
        assert_eq!(monitor.verdict(), FpsVerdict::Low);
    }

    #[test]
    fn fast_cadence_is_high() {
        let monitor = FrameMonitor::new(120, 2.0, 300);
        // 140 fps: above 122.
        feed_steady(&monitor, 60, 7_142_857);
        assert_eq!(monitor.verdict(), FpsVerdict::High);
    }

    #[test]
    fn gap_counts_missing_frames() {
        let monitor = FrameMonitor::new(120, 2.0, 300);
        monitor.on_rendered(0);
        monitor.on_rendered(E);
        // Gap of 4 intervals: 3 frames missing.
        monitor.on_rendered(E + 4 * E);
        assert_eq!(monitor.drop_count(), 3);
    }

    #[test]
    fn jittery_cadence_in_range_is_unstable() {
        let monitor = FrameMonitor::new(120, 2.0, 300);
        // Alternate short and long intervals averaging E but with spread
        // far beyond 10% of target.
        let mut ts = 0u64;
        for i in 0..60 {
            ts += if i % 2 == 0 { E / 2 } else { E + E / 2 };
            monitor.on_rendered(ts);
        }
        assert_eq!(monitor.verdict(), FpsVerdict::Unstable);
    }

    #[test]
    fn window_is_bounded() {
        let monitor = FrameMonitor::new(120, 2.0, 50);
        feed_steady(&monitor, 500, E);
        assert!(monitor.stats().samples <= 50);
        assert_eq!(monitor.total_rendered(), 500);
    }
}
