use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Sliding-window transfer rate.
#[derive(Debug, Clone)]
pub struct RateTracker {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant, received: u64) {
        self.samples.push_back((at, received));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((t, _)) if at.saturating_duration_since(*t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second over the window, 0 until two samples are apart in time.
    pub fn rate(&self) -> u64 {
        let (Some((t0, b0)), Some((t1, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = t1.saturating_duration_since(*t0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (b1.saturating_sub(*b0) as f64 / elapsed) as u64
    }

    /// Estimated milliseconds until `total`, 0 when the rate is unknown.
    pub fn remaining_ms(&self, received: u64, total: u64) -> u64 {
        let rate = self.rate();
        if rate == 0 {
            return 0;
        }
        total.saturating_sub(received).saturating_mul(1000) / rate
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
