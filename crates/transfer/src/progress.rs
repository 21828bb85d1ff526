//! Transfer speed measurement.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Average transfer speed over a sliding window of recent samples.
///
/// Feed it byte increments as blocks land; [`bytes_per_second`] smooths over
/// the window so the number shown to the user doesn't jump with every block.
///
/// [`bytes_per_second`]: SpeedCalculator::bytes_per_second
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl SpeedCalculator {
    /// Creates a calculator.
    ///
    /// - `window`: time span of samples considered (default 5 s).
    /// - `max_samples`: retained sample cap (default 100).
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window: window.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        let cutoff = now - s.window;
        s.samples.retain(|sample| sample.timestamp >= cutoff);

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second inside the window. 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes`, `None` while speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().samples.clear();
    }
}
