use std::time::Duration;

use changescope_model::NetworkQuality;

use crate::config::RetryConfig;

/// Backoff schedule for failed main loads, scaled by network quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self, quality: NetworkQuality) -> u32 {
        self.config.max_attempts(quality)
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// attempt cap for `quality` is exceeded.
    pub fn delay(
        &self,
        attempt: u32,
        quality: NetworkQuality,
    ) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts(quality) {
            return None;
        }
        let base = self.config.base_delay(quality).as_millis() as f64;
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = base * self.config.backoff_factor.powi(exponent);
        let capped = delay_ms.min(self.config.backoff_max_ms as f64).max(0.0);
        Some(Duration::from_millis(capped as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poor_network_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=5)
            .map(|attempt| {
                policy
                    .delay(attempt, NetworkQuality::Poor)
                    .expect("within cap")
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(2_000),
                Duration::from_millis(3_000),
                Duration::from_millis(4_500),
                Duration::from_millis(6_750),
                Duration::from_millis(8_000),
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(policy.delay(6, NetworkQuality::Poor).is_none());
    }

    #[test]
    fn better_networks_retry_sooner_and_less() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay(1, NetworkQuality::Fair),
            Some(Duration::from_millis(1_000))
        );
        assert_eq!(
            policy.delay(3, NetworkQuality::Excellent),
            Some(Duration::from_millis(1_125))
        );
        assert!(policy.delay(4, NetworkQuality::Good).is_none());
    }
}
