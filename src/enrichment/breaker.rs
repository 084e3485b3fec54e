use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;
use tracing::{info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Whether a caller may go to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial request after a cool-down. Must not be retried.
    Trial,
    Rejected,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Consecutive-failure circuit breaker shared by all enrichment workers.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Admission::Allowed,
            Inner::Open { until } => {
                if Instant::now() >= until {
                    info!("circuit breaker half-open, sending trial request");
                    *inner = Inner::HalfOpen {
                        trial_in_flight: true,
                    };
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            Inner::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Admission::Rejected
                } else {
                    *inner = Inner::HalfOpen {
                        trial_in_flight: true,
                    };
                    Admission::Trial
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(*inner, Inner::Closed { .. }) {
            info!("circuit breaker closed");
        }
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let open = match *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    true
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures: failures,
                    };
                    false
                }
            }
            Inner::HalfOpen { .. } => true,
            // Late failures from requests started before the trip.
            Inner::Open { .. } => false,
        };

        if open {
            warn!(
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker open, falling back to heuristic scoring"
            );
            *inner = Inner::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, COOLDOWN);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn success_resets_the_count() {
        let breaker = CircuitBreaker::new(2, COOLDOWN);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_opens_after_cooldown_with_single_trial() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();
        assert_eq!(breaker.admit(), Admission::Rejected);

        tokio::time::advance(COOLDOWN).await;
        assert_eq!(breaker.admit(), Admission::Trial);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one trial at a time.
        assert_eq!(breaker.admit(), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_same_cooldown() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();
        tokio::time::advance(COOLDOWN).await;
        assert_eq!(breaker.admit(), Admission::Trial);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(COOLDOWN - Duration::from_secs(1)).await;
        assert_eq!(breaker.admit(), Admission::Rejected);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.admit(), Admission::Trial);
    }
}
