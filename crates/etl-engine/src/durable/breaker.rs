//! Circuit breaker in front of the durable backend
//!
//! Closed: every invocation may try the backend. After `failure_threshold`
//! consecutive failures the breaker opens and invocations go straight to the
//! fallback executor. Once `reset_after` has elapsed a single probe is let
//! through (half-open); its outcome closes or re-opens the breaker.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_after,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    pub fn state(&self) -> BreakerState {
        self.with(|inner| inner.state)
    }

    /// Whether this invocation may try the backend
    pub fn allow(&self) -> bool {
        let reset_after = self.reset_after;
        self.with(|inner| match inner.state {
            BreakerState::Closed => true,
            // One probe at a time
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(reset_after);
                if elapsed >= reset_after {
                    info!("durable backend breaker half-open, probing");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        })
    }

    pub fn record_success(&self) {
        self.with(|inner| {
            if inner.state != BreakerState::Closed {
                info!("durable backend recovered, breaker closed");
            }
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        });
    }

    pub fn record_failure(&self) {
        let threshold = self.failure_threshold;
        self.with(|inner| {
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            let trip = inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= threshold;
            if trip {
                if inner.state != BreakerState::Open {
                    warn!(
                        failures = inner.consecutive_failures,
                        "durable backend breaker open, routing to fallback"
                    );
                }
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
        });
    }
}
