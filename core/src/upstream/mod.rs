// Upstream client fabric
//
// Pools one resilient handle per (kind, credential, mode). Every outbound
// call funnels through `ClientHandle::execute`, which layers the circuit
// breaker, the token-bucket limiter, and retry-with-backoff around the
// caller's future.

mod breaker;
mod limiter;

pub use breaker::{BreakerState, CircuitBreaker, Clock, SystemClock};
pub use limiter::TokenBucket;

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BUCKET_CAPACITY: f64 = 100.0;
const DEFAULT_REFILL_RATE: f64 = 10.0;
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Failure reported by an upstream call, carrying enough shape for the
/// retry classifier.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Network-level failure with no protocol response.
    #[error("transport error: {0}")]
    Transport(String),

    /// Plain HTTP status failure.
    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Typed provider error parsed from a response body.
    #[error("provider error ({kind}): {message}")]
    Provider {
        status: Option<u16>,
        kind: String,
        message: String,
    },
}

impl CallError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Server errors, throttling, and transport failures are retryable;
    /// auth and request-shape errors are not. Unknown typed errors default
    /// to retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Transport(_) => true,
            CallError::Status { status, .. } => *status >= 500 || *status == 429,
            CallError::Provider { status, kind, .. } => {
                if let Some(status) = status {
                    if *status >= 500 || *status == 429 {
                        return true;
                    }
                }
                match kind.as_str() {
                    "api_error" | "rate_limit_error" => true,
                    "authentication_error" | "invalid_request_error" | "card_error" => false,
                    _ => true,
                }
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("circuit breaker open: too many upstream failures")]
    CircuitOpen,

    #[error("{operation}: non-retryable upstream error: {source}")]
    Permanent {
        operation: String,
        #[source]
        source: CallError,
    },

    #[error("{operation}: failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: CallError,
    },

    #[error("upstream credential is required")]
    MissingCredential,
}

/// A pooled upstream client: breaker + limiter + retrying executor.
pub struct ClientHandle {
    kind: String,
    mode: String,
    breaker: CircuitBreaker,
    limiter: TokenBucket,
    max_retries: u32,
    last_used: Mutex<Instant>,
}

impl ClientHandle {
    fn new(kind: &str, mode: &str, max_retries: u32) -> Self {
        Self {
            kind: kind.to_string(),
            mode: mode.to_string(),
            breaker: CircuitBreaker::new(DEFAULT_MAX_FAILURES, DEFAULT_RESET_TIMEOUT),
            limiter: TokenBucket::new(DEFAULT_BUCKET_CAPACITY, DEFAULT_REFILL_RATE),
            max_retries,
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("last_used lock poisoned")
            .elapsed()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run `call` under the full resilience envelope.
    ///
    /// Breaker check, limiter wait, then up to `max_retries + 1` attempts
    /// with exponential backoff. Callers impose deadlines by wrapping the
    /// returned future in `tokio::time::timeout`; the sleeps inside are
    /// dropped with it.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.touch();

        if !self.breaker.try_acquire() {
            return Err(UpstreamError::CircuitOpen);
        }

        self.limiter.acquire().await;

        let attempts = self.max_retries + 1;
        let mut last_error: Option<CallError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff =
                    Duration::from_secs(1u64 << (attempt - 1)).min(BACKOFF_CEILING);
                info!(
                    target: "upstream",
                    kind = %self.kind,
                    operation,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    "retrying upstream call"
                );
                tokio::time::sleep(backoff).await;
            }

            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    if !err.is_retryable() {
                        return Err(UpstreamError::Permanent {
                            operation: operation.to_string(),
                            source: err,
                        });
                    }
                    warn!(
                        target: "upstream",
                        kind = %self.kind,
                        operation,
                        attempt,
                        error = %err,
                        "upstream call failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(UpstreamError::Exhausted {
            operation: operation.to_string(),
            attempts,
            source: last_error.expect("at least one attempt ran"),
        })
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }
}

/// Breaker-state counts reported by the pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStates {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_clients: usize,
    pub breaker_states: BreakerStates,
}

/// Pool of upstream client handles keyed by (kind, credential fingerprint,
/// mode). Handles are created lazily, reused across callers, and evicted
/// after sitting idle.
pub struct ClientPool {
    clients: DashMap<String, Arc<ClientHandle>>,
    max_retries: u32,
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Fetch or create the handle for an upstream credential.
    pub fn handle(
        &self,
        kind: &str,
        credential: &str,
        mode: &str,
    ) -> Result<Arc<ClientHandle>, UpstreamError> {
        self.handle_with_retries(kind, credential, mode, self.max_retries)
    }

    /// Like [`handle`](Self::handle) with an explicit retry budget. Monitors
    /// that sample rather than retry pass zero.
    pub fn handle_with_retries(
        &self,
        kind: &str,
        credential: &str,
        mode: &str,
        max_retries: u32,
    ) -> Result<Arc<ClientHandle>, UpstreamError> {
        if credential.is_empty() {
            return Err(UpstreamError::MissingCredential);
        }

        let fingerprint: String = credential.chars().take(12).collect();
        let key = format!("{kind}:{mode}:{fingerprint}");

        if let Some(existing) = self.clients.get(&key) {
            existing.touch();
            return Ok(existing.clone());
        }

        let handle = Arc::new(ClientHandle::new(kind, mode, max_retries));
        self.clients.insert(key, handle.clone());
        Ok(handle)
    }

    /// Drop handles idle longer than `max_idle`; returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.clients.len();
        self.clients.retain(|key, handle| {
            let idle = handle.idle_for();
            if idle > max_idle {
                info!(
                    target: "upstream",
                    key = %key,
                    idle_secs = idle.as_secs(),
                    "evicting idle upstream client"
                );
                false
            } else {
                true
            }
        });
        before - self.clients.len()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let mut states = BreakerStates::default();
        for entry in self.clients.iter() {
            match entry.breaker_state() {
                BreakerState::Closed => states.closed += 1,
                BreakerState::Open => states.open += 1,
                BreakerState::HalfOpen => states.half_open += 1,
            }
        }
        PoolMetrics {
            total_clients: self.clients.len(),
            breaker_states: states,
        }
    }

    /// Background sweep removing idle clients.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.evict_idle(max_idle);
            }
        })
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}
