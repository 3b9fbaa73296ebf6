use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter for transient object store
/// failures.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following `attempt` (1-based), jittered
    /// into the upper half of the exponential window.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let ceiling = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        let jittered = ceiling * rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delays_grow_and_stay_bounded() {
        let config = RetryConfig::default();
        for attempt in 1..=10 {
            let delay = config.delay(attempt).as_secs_f64();
            let ceiling = (config.initial_delay.as_secs_f64()
                * config.exponential_base.powi(attempt as i32 - 1))
            .min(config.max_delay.as_secs_f64());
            assert!(delay <= ceiling + f64::EPSILON);
            assert!(delay >= ceiling * 0.5 - f64::EPSILON);
        }
        assert!(config.delay(10) <= config.max_delay);
    }
}
