//! Throughput estimation for an in-flight transfer.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Samples older than this no longer describe the current link speed.
const SAMPLE_WINDOW: Duration = Duration::from_secs(5);

/// Hard cap on retained samples; chunks arrive every few milliseconds on a
/// fast link, and one sample per chunk would otherwise grow unbounded
/// within the window.
const MAX_SAMPLES: usize = 128;

/// Sliding-window rate estimator fed one sample per received chunk.
///
/// Lives inside the receiver's per-file state, so it needs no locking of
/// its own.
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedCalculator {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
        }
    }

    /// Records `bytes` received now, discarding samples that fell out of
    /// the window.
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));

        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > SAMPLE_WINDOW || self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average rate over the window, in bytes per second. Zero until two
    /// samples span a measurable interval.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|&(_, bytes)| bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time until `remaining_bytes` arrive at the current rate,
    /// or `None` while the rate is still unknown.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / rate))
    }
}
