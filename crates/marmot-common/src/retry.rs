//! Small backoff helper used by the webhook dispatcher
//! ([`crate::config::RetryConfig::delay_for_attempt`] does the actual math;
//! this is just the thin wrapper callers reach for) and available to any
//! other component that needs `delay = base * attempt^2` bounded
//! exponential backoff without pulling in a whole retry crate.

use crate::config::RetryConfig;
use std::time::Duration;

pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    config.delay_for_attempt(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 1.0,
        };
        let d1 = backoff_delay(&config, 1);
        let d2 = backoff_delay(&config, 2);
        let d3 = backoff_delay(&config, 3);
        assert!(d2 > d1);
        assert!(d3 > d2);
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 1.0,
        };
        let d = backoff_delay(&config, 50);
        assert!(d <= Duration::from_secs(1));
    }
}
