//! Consecutive-failure circuit breaker.
//!
//! A breaker trips after `trip_threshold` consecutive failures observed
//! within `window`. While open, callers fail fast; after `reset` elapses a
//! single probe call is allowed through (half-open), and its outcome decides
//! whether the breaker closes again or re-opens.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for circuit breaking.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures required to open the breaker.
    pub trip_threshold: u32,
    /// Failures older than this no longer count toward the streak.
    pub window: Duration,
    /// How long the breaker stays open before allowing a probe.
    pub reset: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            window: Duration::from_secs(60),
            reset: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
        first_failure_at: Option<Instant>,
    },
    Open {
        opened_at: Instant,
    },
    HalfOpen,
}

/// Circuit breaker shared by clients of one logical downstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
                first_failure_at: None,
            }),
        }
    }

    /// Whether a call may proceed. An open breaker transitions to half-open
    /// once the reset period has elapsed, admitting exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match *inner {
            Inner::Closed { .. } => true,
            Inner::HalfOpen => false,
            Inner::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset {
                    *inner = Inner::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::Closed {
            consecutive_failures: 0,
            first_failure_at: None,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match *inner {
            Inner::HalfOpen => {
                // Probe failed; re-open.
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
            Inner::Closed {
                consecutive_failures,
                first_failure_at,
            } => {
                let now = Instant::now();
                // A stale streak restarts the count.
                let (count, started) = match first_failure_at {
                    Some(started) if now.duration_since(started) <= self.config.window => {
                        (consecutive_failures + 1, started)
                    }
                    _ => (1, now),
                };

                if count >= self.config.trip_threshold {
                    tracing::warn!(
                        failures = count,
                        "circuit breaker opened after consecutive failures"
                    );
                    *inner = Inner::Open { opened_at: now };
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures: count,
                        first_failure_at: Some(started),
                    };
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock().unwrap() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }
}
