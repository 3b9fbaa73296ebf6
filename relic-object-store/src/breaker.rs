use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::StoreError;

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Circuit breaker over object store calls.
///
/// After `failure_threshold` consecutive failures the circuit opens for
/// `recovery_timeout`; calls during that window fail fast as transient
/// errors. The first call after the window runs as a half-open probe.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn check(&self) -> Result<(), StoreError> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { since } => {
                if now.duration_since(since) >= self.recovery_timeout {
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(StoreError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.state.lock().unwrap() = State::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    log::warn!(
                        "circuit breaker opened after {} consecutive failures",
                        failures
                    );
                    State::Open { since: Instant::now() }
                } else {
                    State::Closed { failures }
                }
            }
            // a failed probe re-opens the circuit
            State::HalfOpen | State::Open { .. } => State::Open { since: Instant::now() },
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let start = Instant::now();

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check_at(start).is_ok());
        breaker.record_failure();
        assert!(matches!(
            breaker.check_at(start),
            Err(StoreError::CircuitOpen)
        ));

        // still open inside the window
        assert!(breaker.check_at(start + Duration::from_secs(30)).is_err());

        // half-open probe after the window
        assert!(breaker.check_at(start + Duration::from_secs(61)).is_ok());
        breaker.record_success();
        assert!(breaker.check_at(start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let start = Instant::now();
        breaker.record_failure();
        assert!(breaker.check_at(start + Duration::from_secs(61)).is_ok());
        breaker.record_failure();
        assert!(breaker.check_at(start + Duration::from_secs(61)).is_err());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.check().is_ok());
    }
}
