use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket limiting S3 request throughput.
///
/// The bucket refills continuously at `requests_per_second` and holds at
/// most one second worth of burst.
pub struct RateLimiter {
    rate: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        Self {
            rate: requests_per_second,
            state: Mutex::new(Bucket { tokens: requests_per_second, last_refill: Instant::now() }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate.max(1.0));
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(100.0);
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn draining_the_bucket_forces_a_wait() {
        let limiter = RateLimiter::new(20.0);
        let start = Instant::now();
        // capacity is one second of tokens; going past it must sleep
        for _ in 0..25 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
