//! Endpoint Health Manager (§4.4): owns the circuit breaker and response-time
//! / error-rate metrics for every endpoint the Router has registered.
//!
//! Grounded in the teacher's `ProviderHealthTracker` (`provider_health.rs`),
//! which owns an `Arc<RwLock<HashMap<Uuid, AccountHealth>>>` and exposes
//! `record_success`/`record_failure`/`is_healthy`. This module generalizes
//! that into the spec's `register/isAvailable/execute/metrics/reset` surface
//! with a real circuit breaker underneath instead of a flat cooldown flag.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, Outcome, State, Transition};
use crate::error::ErrorKind;

const STALE_AFTER: Duration = Duration::from_secs(24 * 3600);
const MAX_ENDPOINTS: usize = 500;
const RETAIN_ON_CLEANUP: usize = 250;
const EMA_ALPHA: f64 = 0.2;

/// Response-time/error-rate metrics tracked per endpoint. `avg_latency` is an
/// exponential moving average with `alpha = 0.2`, the smoothing constant the
/// teacher uses for its own health scoring heuristics.
#[derive(Debug, Clone, Default)]
pub struct HealthMetrics {
    pub total_requests: u64,
    pub total_failures: u64,
    pub avg_latency: Duration,
    pub last_latency: Duration,
}

impl HealthMetrics {
    fn record(&mut self, latency: Duration, failed: bool) {
        self.total_requests += 1;
        if failed {
            self.total_failures += 1;
        }
        self.last_latency = latency;
        if self.total_requests == 1 {
            self.avg_latency = latency;
        } else {
            let prev = self.avg_latency.as_secs_f64();
            let sample = latency.as_secs_f64();
            let next = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev;
            self.avg_latency = Duration::from_secs_f64(next.max(0.0));
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }
}

struct EndpointEntry {
    breaker: CircuitBreaker,
    metrics: HealthMetrics,
    last_used: Instant,
}

/// Patterns matched against error messages to force an `immediate-failure`
/// classification independent of HTTP status (§4.4 defaults).
fn default_permanent_failure_patterns() -> Vec<Regex> {
    [
        r"(?i)404.*not found",
        r"(?i)401.*unauthorized",
        r"(?i)authentication.*failed",
        r"(?i)invalid.*credentials",
        r"(?i)api.*key.*invalid",
        r"(?i)endpoint.*not.*found",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}

pub struct EndpointHealthManager {
    endpoints: RwLock<HashMap<String, Arc<Mutex<EndpointEntry>>>>,
    default_config: CircuitBreakerConfig,
    permanent_failure_patterns: Vec<Regex>,
}

impl EndpointHealthManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            default_config,
            permanent_failure_patterns: default_permanent_failure_patterns(),
        }
    }

    pub fn with_permanent_failure_patterns(mut self, patterns: Vec<Regex>) -> Self {
        self.permanent_failure_patterns = patterns;
        self
    }

    /// Idempotent: a second `register` for the same id is a no-op.
    pub async fn register(&self, endpoint_id: &str, config: Option<CircuitBreakerConfig>) {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(endpoint_id) {
            return;
        }
        endpoints.insert(
            endpoint_id.to_string(),
            Arc::new(Mutex::new(EndpointEntry {
                breaker: CircuitBreaker::new(config.unwrap_or(self.default_config)),
                metrics: HealthMetrics::default(),
                last_used: Instant::now(),
            })),
        );
    }

    pub async fn is_available(&self, endpoint_id: &str) -> bool {
        let Some(entry) = self.entry(endpoint_id).await else {
            return false;
        };
        let mut entry = entry.lock().await;
        entry.breaker.is_available(Instant::now())
    }

    /// Classify an error message against the permanent-failure regex list,
    /// upgrading the classification to `immediate-failure` on a match.
    pub fn classify_message(&self, kind: ErrorKind, message: &str) -> ErrorKind {
        if matches!(kind, ErrorKind::ImmediateFailure) {
            return kind;
        }
        if self.permanent_failure_patterns.iter().any(|re| re.is_match(message)) {
            ErrorKind::ImmediateFailure
        } else {
            kind
        }
    }

    /// Runs `op` under the circuit-breaker decision, applying the derived
    /// deadline `min(op_timeout, ctx_remaining)` and recording the outcome.
    /// Returns `Err(ErrorKind::CircuitOpen)` without invoking `op` if the
    /// breaker currently rejects traffic.
    pub async fn execute<F, Fut, T>(
        &self,
        endpoint_id: &str,
        op_timeout: Duration,
        ctx_remaining: Duration,
        op: F,
    ) -> Result<T, ErrorKind>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<T, ErrorKind>>,
    {
        let entry = self
            .entry(endpoint_id)
            .await
            .ok_or(ErrorKind::AllEndpointsExhausted)?;

        {
            let mut guard = entry.lock().await;
            if !guard.breaker.is_available(Instant::now()) {
                return Err(ErrorKind::CircuitOpen);
            }
            guard.breaker.begin_attempt();
            guard.last_used = Instant::now();
        }

        let deadline = op_timeout.min(ctx_remaining);
        if deadline.is_zero() {
            return Err(ErrorKind::Timeout);
        }

        let started = Instant::now();
        let result = tokio::time::timeout(deadline, op(deadline)).await;
        let elapsed = started.elapsed();

        let (outcome, returned) = match result {
            Ok(Ok(value)) => (Outcome::Success, Ok(value)),
            Ok(Err(kind)) => (Outcome::Failure(kind), Err(kind)),
            Err(_) => (Outcome::Failure(ErrorKind::Timeout), Err(ErrorKind::Timeout)),
        };

        let mut guard = entry.lock().await;
        guard.metrics.record(elapsed, matches!(outcome, Outcome::Failure(_)));
        if let Some(transition) = guard.breaker.record(outcome, Instant::now()) {
            log_transition(endpoint_id, &transition);
        }

        returned
    }

    pub async fn metrics(&self, endpoint_id: &str) -> Option<HealthMetrics> {
        let entry = self.entry(endpoint_id).await?;
        let guard = entry.lock().await;
        Some(guard.metrics.clone())
    }

    pub async fn state(&self, endpoint_id: &str) -> Option<State> {
        let entry = self.entry(endpoint_id).await?;
        let guard = entry.lock().await;
        Some(guard.breaker.state())
    }

    pub async fn reset(&self, endpoint_id: &str) {
        if let Some(entry) = self.entry(endpoint_id).await {
            let mut guard = entry.lock().await;
            guard.breaker.reset();
            guard.metrics = HealthMetrics::default();
        }
    }

    async fn entry(&self, endpoint_id: &str) -> Option<Arc<Mutex<EndpointEntry>>> {
        self.endpoints.read().await.get(endpoint_id).cloned()
    }

    /// Removes endpoints idle for more than 24h; if the total still exceeds
    /// 500, keeps only the 250 most recently used (§4.4). Intended to run
    /// alongside the 30s recovery sweep.
    pub async fn cleanup_stale(&self) {
        let now = Instant::now();
        let mut endpoints = self.endpoints.write().await;

        let mut last_used: Vec<(String, Instant)> = Vec::with_capacity(endpoints.len());
        for (id, entry) in endpoints.iter() {
            let used = entry.lock().await.last_used;
            last_used.push((id.clone(), used));
        }

        let stale: Vec<String> = last_used
            .iter()
            .filter(|(_, used)| now.saturating_duration_since(*used) > STALE_AFTER)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            endpoints.remove(id);
            debug!(endpoint_id = %id, "removed stale endpoint from health manager");
        }

        if endpoints.len() > MAX_ENDPOINTS {
            last_used.retain(|(id, _)| endpoints.contains_key(id));
            last_used.sort_by_key(|(_, used)| std::cmp::Reverse(*used));
            let to_remove: Vec<String> = last_used
                .iter()
                .skip(RETAIN_ON_CLEANUP)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &to_remove {
                endpoints.remove(id);
            }
            info!(
                removed = to_remove.len(),
                retained = RETAIN_ON_CLEANUP,
                "endpoint cap exceeded, trimmed to most recently used"
            );
        }
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }
}

fn log_transition(endpoint_id: &str, transition: &Transition) {
    info!(
        endpoint_id = %endpoint_id,
        from = ?transition.from,
        to = ?transition.to,
        reason = transition.reason,
        "circuit breaker transition"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            ..CircuitBreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        mgr.register("ep-1", None).await;
        mgr.register("ep-1", None).await;
        assert_eq!(mgr.endpoint_count().await, 1);
    }

    #[tokio::test]
    async fn unregistered_endpoint_is_unavailable() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        assert!(!mgr.is_available("ghost").await);
    }

    #[tokio::test]
    async fn execute_records_success_metrics() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        mgr.register("ep-1", None).await;
        let result: Result<&str, ErrorKind> = mgr
            .execute("ep-1", Duration::from_secs(1), Duration::from_secs(1), |_d| async {
                Ok("ok")
            })
            .await;
        assert_eq!(result, Ok("ok"));
        let metrics = mgr.metrics("ep-1").await.unwrap();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.total_failures, 0);
    }

    #[tokio::test]
    async fn circuit_open_rejects_without_calling_op() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        mgr.register("ep-1", None).await;
        for _ in 0..2 {
            let _: Result<(), ErrorKind> = mgr
                .execute("ep-1", Duration::from_secs(1), Duration::from_secs(1), |_d| async {
                    Err(ErrorKind::Transient)
                })
                .await;
        }
        assert!(!mgr.is_available("ep-1").await);

        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        let result: Result<(), ErrorKind> = mgr
            .execute("ep-1", Duration::from_secs(1), Duration::from_secs(1), move |_d| async move {
                called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(ErrorKind::CircuitOpen));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deadline_of_zero_fails_without_io() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        mgr.register("ep-1", None).await;
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        let result: Result<(), ErrorKind> = mgr
            .execute("ep-1", Duration::from_secs(1), Duration::ZERO, move |_d| async move {
                called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(ErrorKind::Timeout));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reset_clears_breaker_and_metrics() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        mgr.register("ep-1", None).await;
        for _ in 0..2 {
            let _: Result<(), ErrorKind> = mgr
                .execute("ep-1", Duration::from_secs(1), Duration::from_secs(1), |_d| async {
                    Err(ErrorKind::Transient)
                })
                .await;
        }
        mgr.reset("ep-1").await;
        assert!(mgr.is_available("ep-1").await);
        assert_eq!(mgr.metrics("ep-1").await.unwrap().total_requests, 0);
    }

    #[test]
    fn permanent_failure_patterns_match_known_messages() {
        let mgr = EndpointHealthManager::new(fast_cfg());
        assert_eq!(
            mgr.classify_message(ErrorKind::Transient, "401 Unauthorized: bad key"),
            ErrorKind::ImmediateFailure
        );
        assert_eq!(
            mgr.classify_message(ErrorKind::Transient, "connection reset by peer"),
            ErrorKind::Transient
        );
    }
}
