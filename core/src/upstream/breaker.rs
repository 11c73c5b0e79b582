// Circuit breaker guarding a single upstream client
//
// Closed -> Open after `max_failures` consecutive failures; Open -> HalfOpen
// once the reset timeout has elapsed and a call arrives; HalfOpen admits a
// single probe whose outcome decides Closed or Open.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Time source for breaker transitions, injected so tests run deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self::with_clock(max_failures, reset_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(max_failures: u32, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_failures,
            reset_timeout,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// An Open breaker whose reset timeout has elapsed transitions to
    /// HalfOpen and admits exactly one probe; concurrent callers are
    /// rejected until the probe's outcome is recorded.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| self.clock.now().duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.failures = 0;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::HalfOpen {
            info!(target: "upstream", "circuit breaker closed, upstream recovered");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failures += 1;
        inner.last_failure = Some(self.clock.now());
        inner.probe_in_flight = false;

        if inner.state == BreakerState::HalfOpen || inner.failures >= self.max_failures {
            if inner.state != BreakerState::Open {
                error!(
                    target: "upstream",
                    failures = inner.failures,
                    reset_timeout_secs = self.reset_timeout.as_secs(),
                    "circuit breaker opened, too many failures"
                );
            }
            inner.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }
}
