//! Download progress estimation for the main load.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const HISTORY_LEN: usize = 10;
const SPEED_WINDOW: usize = 3;
const ETA_WINDOW: usize = 5;

/// Progress information for an in-flight main load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadProgress {
    /// 0.0..=100.0
    pub percent: f64,

    /// Seconds until done at the recent rate, if the rate is known
    pub eta_secs: Option<f64>,

    /// Recent transfer rate
    pub bytes_per_second: f64,

    /// Bytes received so far
    pub loaded_bytes: u64,

    /// Expected body size
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Rolling byte-count history for one download.
///
/// Emission is throttled to one update per `interval`, and only happens when
/// the server announced a body size.
#[derive(Debug)]
pub struct ProgressTracker {
    total: Option<u64>,
    interval: Duration,
    last_emit: Instant,
    samples: VecDeque<Sample>,
}

impl ProgressTracker {
    pub fn new(
        total: Option<u64>,
        interval: Duration,
        started: Instant,
    ) -> Self {
        let mut samples = VecDeque::with_capacity(HISTORY_LEN);
        samples.push_back(Sample {
            at: started,
            bytes: 0,
        });
        Self {
            total,
            interval,
            last_emit: started,
            samples,
        }
    }

    /// Record that `loaded` bytes have arrived by `now`. Returns a progress
    /// update when one is due.
    pub fn record(
        &mut self,
        loaded: u64,
        now: Instant,
    ) -> Option<LoadProgress> {
        let total = self.total.filter(|total| *total > 0)?;
        if now.saturating_duration_since(self.last_emit) < self.interval {
            return None;
        }
        self.last_emit = now;

        self.samples.push_back(Sample { at: now, bytes: loaded });
        while self.samples.len() > HISTORY_LEN {
            self.samples.pop_front();
        }

        let bytes_per_second = self.rate(SPEED_WINDOW).unwrap_or(0.0);
        let remaining = total.saturating_sub(loaded);
        let eta_secs = self
            .rate(ETA_WINDOW)
            .filter(|rate| *rate > 0.0)
            .map(|rate| remaining as f64 / rate);

        Some(LoadProgress {
            percent: (loaded as f64 / total as f64 * 100.0).min(100.0),
            eta_secs,
            bytes_per_second,
            loaded_bytes: loaded,
            total_bytes: total,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Bytes per second across the most recent `window` samples.
    fn rate(&self, window: usize) -> Option<f64> {
        let len = self.samples.len();
        if len < 2 {
            return None;
        }
        let first = self.samples[len.saturating_sub(window)];
        let last = self.samples[len - 1];
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(last.bytes.saturating_sub(first.bytes) as f64 / elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn throttles_to_interval() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Some(1_000), INTERVAL, start);

        let early = start + Duration::from_millis(50);
        assert!(tracker.record(100, early).is_none());
        let update = tracker
            .record(200, start + Duration::from_millis(100))
            .expect("due");
        assert_eq!(update.percent, 20.0);
        let throttled = start + Duration::from_millis(150);
        assert!(tracker.record(300, throttled).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_updates_without_a_size_hint() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(None, INTERVAL, start);
        assert!(tracker.record(500, start + Duration::from_secs(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn speed_and_eta_follow_recent_samples() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Some(10_000), INTERVAL, start);

        // Steady 1000 bytes per 100ms, i.e. 10 kB/s.
        let mut last = None;
        for step in 1..=4u64 {
            last = tracker.record(step * 1_000, start + INTERVAL * step as u32);
        }
        let update = last.expect("due");
        assert!((update.bytes_per_second - 10_000.0).abs() < 1.0);
        let eta = update.eta_secs.expect("rate known");
        assert!((eta - 0.6).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Some(u64::MAX), INTERVAL, start);
        for step in 1..=30u32 {
            tracker.record(u64::from(step) * 10, start + INTERVAL * step);
        }
        assert_eq!(tracker.sample_count(), 10);
    }
}
