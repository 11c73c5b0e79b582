// Health checks and metrics exposition
//
// Named checks run in parallel with a per-check deadline and a shared TTL
// cache. The overall status is the worst individual result. Metrics are
// rendered in the text exposition format from live component stats.

use crate::snapshots::{SnapshotStore, StoreStats};
use crate::upstream::{ClientPool, PoolMetrics};
use crate::VERSION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::RwLock;
use tracing::warn;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const CHECK_DEADLINE: Duration = Duration::from_secs(5);
const MEMORY_THRESHOLD_MB: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, message)
    }

    fn with_status(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            details: None,
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Aggregate health document served over HTTP.
#[derive(Clone, Debug, Serialize)]
pub struct HealthDocument {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: &'static str,
    pub checks: HashMap<String, CheckResult>,
}

/// A named health probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> CheckResult;
}

pub struct HealthChecker {
    checks: Vec<Arc<dyn HealthCheck>>,
    cache: RwLock<HashMap<String, CheckResult>>,
    cache_ttl: Duration,
    started: Instant,
}

impl HealthChecker {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self {
            checks,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
            started: Instant::now(),
        }
    }

    /// Checker with the default probes registered.
    pub fn with_defaults(pool: Arc<ClientPool>, store: Arc<dyn SnapshotStore>) -> Self {
        Self::new(vec![
            Arc::new(StoreCheck { store }),
            Arc::new(PoolCheck { pool }),
            Arc::new(MemoryCheck),
        ])
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Evaluate stale checks in parallel and return the aggregate document.
    pub async fn run_checks(&self) -> HealthDocument {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.cache_ttl).unwrap_or_default();

        let stale: Vec<Arc<dyn HealthCheck>> = {
            let cache = self.cache.read().await;
            self.checks
                .iter()
                .filter(|check| {
                    cache
                        .get(check.name())
                        .map_or(true, |cached| now - cached.timestamp >= ttl)
                })
                .cloned()
                .collect()
        };

        let evaluations = stale.into_iter().map(|check| async move {
            let started = Instant::now();
            let mut result = match tokio::time::timeout(CHECK_DEADLINE, check.check()).await {
                Ok(result) => result,
                Err(_) => CheckResult::unhealthy("check deadline exceeded"),
            };
            result.timestamp = Utc::now();
            result.duration_ms = started.elapsed().as_millis() as u64;
            (check.name().to_string(), result)
        });
        let fresh: Vec<(String, CheckResult)> = join_all(evaluations).await;

        let mut cache = self.cache.write().await;
        for (name, result) in fresh {
            cache.insert(name, result);
        }

        let checks: HashMap<String, CheckResult> = self
            .checks
            .iter()
            .filter_map(|check| {
                cache
                    .get(check.name())
                    .map(|result| (check.name().to_string(), result.clone()))
            })
            .collect();

        let mut status = HealthStatus::Healthy;
        for result in checks.values() {
            match result.status {
                HealthStatus::Unhealthy => {
                    status = HealthStatus::Unhealthy;
                    break;
                }
                HealthStatus::Degraded => status = HealthStatus::Degraded,
                HealthStatus::Healthy => {}
            }
        }

        HealthDocument {
            status,
            timestamp: Utc::now(),
            uptime_seconds: self.uptime_seconds(),
            version: VERSION,
            checks,
        }
    }

    /// Background sweep that logs non-healthy aggregates.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let document = checker.run_checks().await;
                if document.status != HealthStatus::Healthy {
                    warn!(
                        target: "health",
                        status = ?document.status,
                        checks = document.checks.len(),
                        "health check sweep found problems"
                    );
                }
            }
        })
    }
}

struct StoreCheck {
    store: Arc<dyn SnapshotStore>,
}

#[async_trait]
impl HealthCheck for StoreCheck {
    fn name(&self) -> &'static str {
        "snapshot_store"
    }

    async fn check(&self) -> CheckResult {
        let stats = self.store.stats().await;
        CheckResult::healthy("snapshot store operational").with_details(serde_json::json!({
            "revenue_records": stats.revenue_records,
            "customer_records": stats.customer_records,
            "modes": stats.modes,
        }))
    }
}

struct PoolCheck {
    pool: Arc<ClientPool>,
}

#[async_trait]
impl HealthCheck for PoolCheck {
    fn name(&self) -> &'static str {
        "upstream_pool"
    }

    async fn check(&self) -> CheckResult {
        let metrics = self.pool.metrics();
        let open = metrics.breaker_states.open;
        let details = serde_json::to_value(&metrics).unwrap_or_default();
        if open > 0 {
            CheckResult::degraded(format!("{open} circuit(s) open")).with_details(details)
        } else {
            CheckResult::healthy("upstream pool operational").with_details(details)
        }
    }
}

struct MemoryCheck;

#[async_trait]
impl HealthCheck for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(&self) -> CheckResult {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_memory());

        let Some(process) = system.process(pid) else {
            return CheckResult::degraded("process stats unavailable");
        };
        let used_mb = process.memory() / 1024 / 1024;

        let status = if used_mb > MEMORY_THRESHOLD_MB * 2 {
            HealthStatus::Unhealthy
        } else if used_mb > MEMORY_THRESHOLD_MB {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        CheckResult {
            status,
            message: Some(format!("memory usage: {used_mb} MB")),
            details: Some(serde_json::json!({
                "used_mb": used_mb,
                "threshold_mb": MEMORY_THRESHOLD_MB,
            })),
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Inputs for the metrics endpoint, gathered from live components.
pub struct MetricsInput {
    pub uptime_seconds: u64,
    pub widget_count: usize,
    pub pool: PoolMetrics,
    pub store: StoreStats,
    pub webhook_events: usize,
}

/// Render the text exposition document.
pub fn render_metrics(input: &MetricsInput) -> String {
    let mut out = String::new();

    out.push_str("# HELP scry_uptime_seconds Application uptime in seconds\n");
    out.push_str("# TYPE scry_uptime_seconds counter\n");
    out.push_str(&format!("scry_uptime_seconds {}\n\n", input.uptime_seconds));

    out.push_str("# HELP scry_widgets_total Widgets in the active application snapshot\n");
    out.push_str("# TYPE scry_widgets_total gauge\n");
    out.push_str(&format!("scry_widgets_total {}\n\n", input.widget_count));

    out.push_str("# HELP scry_upstream_clients_total Pooled upstream clients\n");
    out.push_str("# TYPE scry_upstream_clients_total gauge\n");
    out.push_str(&format!(
        "scry_upstream_clients_total {}\n\n",
        input.pool.total_clients
    ));

    out.push_str("# HELP scry_circuit_breaker_state Breaker counts by state\n");
    out.push_str("# TYPE scry_circuit_breaker_state gauge\n");
    out.push_str(&format!(
        "scry_circuit_breaker_state{{state=\"closed\"}} {}\n",
        input.pool.breaker_states.closed
    ));
    out.push_str(&format!(
        "scry_circuit_breaker_state{{state=\"half_open\"}} {}\n",
        input.pool.breaker_states.half_open
    ));
    out.push_str(&format!(
        "scry_circuit_breaker_state{{state=\"open\"}} {}\n\n",
        input.pool.breaker_states.open
    ));

    out.push_str("# HELP scry_snapshot_records_total Records held by the snapshot store\n");
    out.push_str("# TYPE scry_snapshot_records_total gauge\n");
    out.push_str(&format!(
        "scry_snapshot_records_total{{kind=\"revenue\"}} {}\n",
        input.store.revenue_records
    ));
    out.push_str(&format!(
        "scry_snapshot_records_total{{kind=\"customers\"}} {}\n\n",
        input.store.customer_records
    ));

    out.push_str("# HELP scry_webhook_events_total Webhook events in the processed log\n");
    out.push_str("# TYPE scry_webhook_events_total gauge\n");
    out.push_str(&format!(
        "scry_webhook_events_total {}\n",
        input.webhook_events
    ));

    out
}
