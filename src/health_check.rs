//! Health Check Scheduler (§4.8): periodically probes each endpoint the
//! Router has registered, feeding outcomes back into the Health Manager
//! exactly like live traffic would.
//!
//! Grounded in the teacher's periodic-sweep style (the 30s recovery sweep
//! implied by `provider_health.rs`'s cooldown bookkeeping, made explicit
//! here as a scheduled `tokio::time::interval` per endpoint).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::adapters::{AdapterRegistry, ProviderAdapter};
use crate::circuit_breaker::Outcome;
use crate::context::RequestContext;
use crate::credentials::{CredentialRef, CredentialResolver};
use crate::error::ErrorKind;
use crate::events::{EventLog, GatewayEvent};
use crate::health::EndpointHealthManager;

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), timeout: Duration::from_secs(5) }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProbeMetrics {
    pub passes: u64,
    pub failures: u64,
    pub avg_latency: Duration,
}

struct EndpointProbeState {
    /// Coalescing flag: a probe never runs while live traffic is in-flight
    /// for the same endpoint (§4.8). The Router increments/decrements a
    /// separate concurrency counter; this flag is a coarser "don't even try"
    /// signal set for the probe's own duration only.
    in_flight: AtomicBool,
    passes: AtomicU64,
    failures: AtomicU64,
    /// Sum of every probe's wall-clock duration in millis, divided by
    /// `passes + failures` in `metrics()` to get the running average.
    total_latency_millis: AtomicU64,
}

impl Default for EndpointProbeState {
    fn default() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_latency_millis: AtomicU64::new(0),
        }
    }
}

pub struct HealthCheckScheduler {
    config: HealthCheckConfig,
    health: Arc<EndpointHealthManager>,
    credentials: Arc<CredentialResolver>,
    adapters: AdapterRegistry,
    events: Arc<EventLog>,
    endpoint_credentials: Mutex<HashMap<String, CredentialRef>>,
    probe_state: Mutex<HashMap<String, Arc<EndpointProbeState>>>,
}

impl HealthCheckScheduler {
    pub fn new(
        config: HealthCheckConfig,
        health: Arc<EndpointHealthManager>,
        credentials: Arc<CredentialResolver>,
        adapters: AdapterRegistry,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            health,
            credentials,
            adapters,
            events,
            endpoint_credentials: Mutex::new(HashMap::new()),
            probe_state: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules a periodic probe for `endpoint_id`. Called once per endpoint
    /// the Router registers at startup. Returns the task handle so the
    /// caller can cancel it on shutdown.
    pub async fn schedule(self: &Arc<Self>, endpoint_id: String, credential_ref: CredentialRef) -> tokio::task::JoinHandle<()> {
        self.endpoint_credentials
            .lock()
            .await
            .insert(endpoint_id.clone(), credential_ref);
        self.probe_state
            .lock()
            .await
            .entry(endpoint_id.clone())
            .or_insert_with(|| Arc::new(EndpointProbeState::default()));

        let scheduler = self.clone();
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                scheduler.probe_once(&endpoint_id).await;
            }
        })
    }

    async fn probe_once(&self, endpoint_id: &str) {
        let Some(state) = self.probe_state.lock().await.get(endpoint_id).cloned() else {
            return;
        };
        if state.in_flight.swap(true, Ordering::SeqCst) {
            debug!(endpoint_id, "skipping probe, live traffic in-flight");
            return;
        }

        let started = std::time::Instant::now();
        let result = self.run_probe(endpoint_id).await;
        let elapsed = started.elapsed();
        state.in_flight.store(false, Ordering::SeqCst);
        state.total_latency_millis.fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);

        match result {
            Ok(()) => {
                state.passes.fetch_add(1, Ordering::SeqCst);
            }
            Err(kind) => {
                state.failures.fetch_add(1, Ordering::SeqCst);
                self.events
                    .record(GatewayEvent::HealthCheckFailed {
                        endpoint_id: endpoint_id.to_string(),
                        message: format!("{kind:?}"),
                        at: chrono::Utc::now(),
                    })
                    .await;
            }
        }
    }

    async fn run_probe(&self, endpoint_id: &str) -> Result<(), ErrorKind> {
        let Some(adapter) = self.adapters.get(endpoint_id) else {
            return Err(ErrorKind::ModelUnknown);
        };
        let credential_ref = {
            let refs = self.endpoint_credentials.lock().await;
            refs.get(endpoint_id).cloned().ok_or(ErrorKind::CredentialError)?
        };
        let credential = self
            .credentials
            .resolve(&credential_ref, self.config.timeout)
            .await
            .map_err(|_| ErrorKind::CredentialError)?;

        let ctx = RequestContext::generate(self.config.timeout);
        let outcome = self
            .health
            .execute(endpoint_id, self.config.timeout, ctx.remaining(), |_d| {
                let adapter: Arc<dyn ProviderAdapter> = adapter.clone();
                let credential = credential.clone();
                let ctx = ctx.clone();
                async move { adapter.health_probe(&credential, &ctx).await }
            })
            .await;

        if outcome.is_ok() {
            self.events
                .record(GatewayEvent::HealthCheckRecovered {
                    endpoint_id: endpoint_id.to_string(),
                    at: chrono::Utc::now(),
                })
                .await;
        }

        outcome
    }

    pub async fn metrics(&self, endpoint_id: &str) -> ProbeMetrics {
        let Some(state) = self.probe_state.lock().await.get(endpoint_id).cloned() else {
            return ProbeMetrics::default();
        };
        let passes = state.passes.load(Ordering::SeqCst);
        let failures = state.failures.load(Ordering::SeqCst);
        let total = passes + failures;
        let avg_latency = if total > 0 {
            Duration::from_millis(state.total_latency_millis.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };
        ProbeMetrics { passes, failures, avg_latency }
    }
}

/// Convenience for tests: maps a raw `Result<(), ErrorKind>` into the breaker
/// `Outcome` the rest of the health stack expects.
pub fn to_outcome(result: &Result<(), ErrorKind>) -> Outcome {
    match result {
        Ok(()) => Outcome::Success,
        Err(kind) => Outcome::Failure(*kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_outcome_maps_result_variants() {
        assert_eq!(to_outcome(&Ok(())), Outcome::Success);
        assert_eq!(to_outcome(&Err(ErrorKind::Transient)), Outcome::Failure(ErrorKind::Transient));
    }

    #[tokio::test]
    async fn metrics_reports_average_probe_latency() {
        let scheduler = Arc::new(HealthCheckScheduler::new(
            HealthCheckConfig::default(),
            Arc::new(EndpointHealthManager::new(crate::circuit_breaker::CircuitBreakerConfig::default())),
            Arc::new(CredentialResolver::new(Default::default())),
            AdapterRegistry::new(),
            Arc::new(EventLog::new(vec![])),
        ));
        scheduler.probe_state.lock().await.insert("ep-1".to_string(), Arc::new(EndpointProbeState::default()));

        {
            let state = scheduler.probe_state.lock().await.get("ep-1").cloned().unwrap();
            state.passes.fetch_add(1, Ordering::SeqCst);
            state.total_latency_millis.fetch_add(40, Ordering::SeqCst);
            state.failures.fetch_add(1, Ordering::SeqCst);
            state.total_latency_millis.fetch_add(60, Ordering::SeqCst);
        }

        let metrics = scheduler.metrics("ep-1").await;
        assert_eq!(metrics.passes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.avg_latency, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn metrics_of_unknown_endpoint_is_zero() {
        let scheduler = Arc::new(HealthCheckScheduler::new(
            HealthCheckConfig::default(),
            Arc::new(EndpointHealthManager::new(crate::circuit_breaker::CircuitBreakerConfig::default())),
            Arc::new(CredentialResolver::new(Default::default())),
            AdapterRegistry::new(),
            Arc::new(EventLog::new(vec![])),
        ));
        let metrics = scheduler.metrics("ghost").await;
        assert_eq!(metrics.avg_latency, Duration::ZERO);
    }
}
