//! Pool Manager (§4.6): groups endpoints by pool, selects an ordered
//! candidate list per policy, and scores aggregate pool health.
//!
//! Grounded in the teacher's `ModelChainStore::resolve_chain`
//! (`provider_health.rs`), which expands a chain of provider entries and
//! filters them by account health before returning an ordered list. This
//! module generalizes that into policy-driven endpoint selection plus the
//! spec's weighted `PoolHealth` score.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use crate::health::EndpointHealthManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    Priority,
    Weighted,
    RoundRobin,
    LeastLatency,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub min_healthy_endpoints: usize,
    pub response_time_threshold: Duration,
    pub error_rate_threshold: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_healthy_endpoints: 1,
            response_time_threshold: Duration::from_millis(2000),
            error_rate_threshold: 0.1,
        }
    }
}

/// A candidate endpoint as known to the Pool Manager: enough metadata to
/// order and filter without reaching into the Health Manager for every
/// field. `priority` is ascending (0 = highest); `weight` is relative, used
/// only by the `weighted` policy.
#[derive(Debug, Clone)]
pub struct EndpointRef {
    pub id: String,
    pub priority: u32,
    pub weight: f64,
}

pub struct Pool {
    pub id: String,
    pub endpoints: Vec<EndpointRef>,
    pub selection_policy: SelectionPolicy,
    pub health_thresholds: HealthThresholds,
    pub fallback_pool_ids: Vec<String>,
    round_robin_counter: AtomicU64,
}

impl Pool {
    pub fn new(
        id: impl Into<String>,
        endpoints: Vec<EndpointRef>,
        selection_policy: SelectionPolicy,
        health_thresholds: HealthThresholds,
        fallback_pool_ids: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoints,
            selection_policy,
            health_thresholds,
            fallback_pool_ids,
            round_robin_counter: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct PoolHealth {
    pub status: PoolStatus,
    pub score: f64,
    pub healthy_count: usize,
    pub total_count: usize,
    pub avg_response_time: Duration,
    pub error_rate: f64,
    pub computed_at: Instant,
}

const POOL_HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

struct CachedHealth {
    health: PoolHealth,
}

pub struct PoolManager {
    pools: HashMap<String, Pool>,
    health_manager: std::sync::Arc<EndpointHealthManager>,
    health_cache: RwLock<HashMap<String, CachedHealth>>,
}

impl PoolManager {
    pub fn new(health_manager: std::sync::Arc<EndpointHealthManager>) -> Self {
        Self {
            pools: HashMap::new(),
            health_manager,
            health_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_pool(&mut self, pool: Pool) {
        self.pools.insert(pool.id.clone(), pool);
    }

    pub fn pool(&self, pool_id: &str) -> Option<&Pool> {
        self.pools.get(pool_id)
    }

    /// Ordered list of currently-available endpoint ids for `pool_id`,
    /// arranged per the pool's selection policy. Unavailable endpoints
    /// (circuit open) are filtered out entirely, not merely deprioritized.
    pub async fn select_endpoints(&self, pool_id: &str) -> Vec<String> {
        let Some(pool) = self.pools.get(pool_id) else {
            return Vec::new();
        };

        let mut available = Vec::new();
        for ep in &pool.endpoints {
            if self.health_manager.is_available(&ep.id).await {
                available.push(ep.clone());
            }
        }
        if available.is_empty() {
            return Vec::new();
        }

        match pool.selection_policy {
            SelectionPolicy::Priority => {
                let mut with_latency = Vec::with_capacity(available.len());
                for ep in available {
                    let latency = self.avg_latency(&ep.id).await;
                    with_latency.push((ep, latency));
                }
                with_latency.sort_by(|(a, al), (b, bl)| {
                    a.priority.cmp(&b.priority).then(al.cmp(bl))
                });
                with_latency.into_iter().map(|(ep, _)| ep.id).collect()
            }
            SelectionPolicy::LeastLatency => {
                let mut with_latency = Vec::with_capacity(available.len());
                for ep in available {
                    let latency = self.avg_latency(&ep.id).await;
                    with_latency.push((ep, latency));
                }
                with_latency.sort_by(|(a, al), (b, bl)| al.cmp(bl).then(a.priority.cmp(&b.priority)));
                with_latency.into_iter().map(|(ep, _)| ep.id).collect()
            }
            SelectionPolicy::RoundRobin => {
                let start = pool.round_robin_counter.fetch_add(1, Ordering::SeqCst) as usize;
                let n = available.len();
                (0..n)
                    .map(|i| available[(start + i) % n].id.clone())
                    .collect()
            }
            SelectionPolicy::Weighted => {
                let mut scored = Vec::with_capacity(available.len());
                for ep in &available {
                    let health_score = self.health_score_factor(&ep.id).await;
                    scored.push((ep.clone(), (ep.weight * health_score).max(0.0001)));
                }
                weighted_shuffle(scored)
            }
        }
    }

    async fn avg_latency(&self, endpoint_id: &str) -> Duration {
        self.health_manager
            .metrics(endpoint_id)
            .await
            .map(|m| m.avg_latency)
            .unwrap_or(Duration::ZERO)
    }

    /// A [0,1]-ish multiplier derived from recent error rate, used only to
    /// weight the `weighted` policy's random draw (not the PoolHealth score).
    async fn health_score_factor(&self, endpoint_id: &str) -> f64 {
        match self.health_manager.metrics(endpoint_id).await {
            Some(m) if m.total_requests > 0 => (1.0 - m.error_rate()).max(0.01),
            _ => 1.0,
        }
    }

    /// `poolHealth(poolId)`, cached for 30s per §3.
    pub async fn pool_health(&self, pool_id: &str) -> Option<PoolHealth> {
        let pool = self.pools.get(pool_id)?;

        {
            let cache = self.health_cache.read().await;
            if let Some(cached) = cache.get(pool_id) {
                if cached.health.computed_at.elapsed() < POOL_HEALTH_CACHE_TTL {
                    return Some(cached.health.clone());
                }
            }
        }

        let mut healthy_count = 0usize;
        let mut total_latency = Duration::ZERO;
        let mut total_requests: u64 = 0;
        let mut total_failures: u64 = 0;
        let total_count = pool.endpoints.len();

        for ep in &pool.endpoints {
            if self.health_manager.is_available(&ep.id).await {
                healthy_count += 1;
            }
            if let Some(metrics) = self.health_manager.metrics(&ep.id).await {
                total_latency += metrics.avg_latency;
                total_requests += metrics.total_requests;
                total_failures += metrics.total_failures;
            }
        }

        let avg_response_time = if total_count > 0 {
            total_latency / total_count as u32
        } else {
            Duration::ZERO
        };
        let error_rate = if total_requests > 0 {
            total_failures as f64 / total_requests as f64
        } else {
            0.0
        };

        let healthy_ratio = if total_count > 0 {
            healthy_count as f64 / total_count as f64
        } else {
            0.0
        };
        let required_ratio = if total_count > 0 {
            pool.health_thresholds.min_healthy_endpoints as f64 / total_count as f64
        } else {
            1.0
        };

        let mut score: f64 = 100.0;

        if healthy_ratio < required_ratio {
            score -= 40.0;
        } else if healthy_ratio < 0.8 {
            score -= 40.0 * (0.8 - healthy_ratio) / 0.8;
        }

        let rt_threshold = pool.health_thresholds.response_time_threshold;
        if avg_response_time > rt_threshold && rt_threshold > Duration::ZERO {
            let overage = avg_response_time.as_secs_f64() - rt_threshold.as_secs_f64();
            let penalty = 30.0 * overage / rt_threshold.as_secs_f64();
            score -= penalty.min(30.0);
        }

        let err_threshold = pool.health_thresholds.error_rate_threshold;
        if error_rate > err_threshold && err_threshold > 0.0 {
            let overage = error_rate - err_threshold;
            let penalty = 30.0 * overage / err_threshold;
            score -= penalty.min(30.0);
        }

        score = score.clamp(0.0, 100.0);

        let status = if healthy_count < pool.health_thresholds.min_healthy_endpoints {
            PoolStatus::Unhealthy
        } else if score < 70.0 {
            PoolStatus::Degraded
        } else {
            PoolStatus::Healthy
        };

        let health = PoolHealth {
            status,
            score,
            healthy_count,
            total_count,
            avg_response_time,
            error_rate,
            computed_at: Instant::now(),
        };

        self.health_cache
            .write()
            .await
            .insert(pool_id.to_string(), CachedHealth { health: health.clone() });

        Some(health)
    }
}

impl PoolStatus {
    pub fn is_routable(&self) -> bool {
        !matches!(self, PoolStatus::Unhealthy)
    }
}

/// Weighted random draw without replacement (§4.6 `weighted` policy).
fn weighted_shuffle(mut candidates: Vec<(EndpointRef, f64)>) -> Vec<String> {
    let mut result = Vec::with_capacity(candidates.len());
    let mut rng = rand::thread_rng();
    while !candidates.is_empty() {
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        let mut pick = rng.gen_range(0.0..total);
        let mut idx = candidates.len() - 1;
        for (i, (_, w)) in candidates.iter().enumerate() {
            if pick < *w {
                idx = i;
                break;
            }
            pick -= w;
        }
        let (ep, _) = candidates.remove(idx);
        result.push(ep.id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;

    async fn manager_with(endpoints: &[&str]) -> std::sync::Arc<EndpointHealthManager> {
        let mgr = std::sync::Arc::new(EndpointHealthManager::new(CircuitBreakerConfig::default()));
        for id in endpoints {
            mgr.register(id, None).await;
        }
        mgr
    }

    #[tokio::test]
    async fn priority_policy_orders_ascending() {
        let mgr = manager_with(&["a", "b"]).await;
        let mut pm = PoolManager::new(mgr);
        pm.add_pool(Pool::new(
            "pool-1",
            vec![
                EndpointRef { id: "b".into(), priority: 2, weight: 1.0 },
                EndpointRef { id: "a".into(), priority: 1, weight: 1.0 },
            ],
            SelectionPolicy::Priority,
            HealthThresholds::default(),
            vec![],
        ));
        let ordered = pm.select_endpoints("pool-1").await;
        assert_eq!(ordered, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn round_robin_advances_each_call() {
        let mgr = manager_with(&["a", "b"]).await;
        let mut pm = PoolManager::new(mgr);
        pm.add_pool(Pool::new(
            "pool-1",
            vec![
                EndpointRef { id: "a".into(), priority: 1, weight: 1.0 },
                EndpointRef { id: "b".into(), priority: 2, weight: 1.0 },
            ],
            SelectionPolicy::RoundRobin,
            HealthThresholds::default(),
            vec![],
        ));
        let first = pm.select_endpoints("pool-1").await;
        let second = pm.select_endpoints("pool-1").await;
        assert_ne!(first[0], second[0]);
    }

    #[tokio::test]
    async fn empty_pool_returns_empty_list() {
        let mgr = manager_with(&[]).await;
        let mut pm = PoolManager::new(mgr);
        pm.add_pool(Pool::new(
            "pool-1",
            vec![],
            SelectionPolicy::Priority,
            HealthThresholds::default(),
            vec![],
        ));
        assert!(pm.select_endpoints("pool-1").await.is_empty());
    }

    #[tokio::test]
    async fn pool_health_unhealthy_when_below_min() {
        let mgr = std::sync::Arc::new(EndpointHealthManager::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        mgr.register("a", None).await;
        use crate::error::ErrorKind;
        let _: Result<(), ErrorKind> = mgr
            .execute("a", Duration::from_secs(1), Duration::from_secs(1), |_| async {
                Err(ErrorKind::ImmediateFailure)
            })
            .await;

        let mut pm = PoolManager::new(mgr);
        pm.add_pool(Pool::new(
            "pool-1",
            vec![EndpointRef { id: "a".into(), priority: 1, weight: 1.0 }],
            SelectionPolicy::Priority,
            HealthThresholds { min_healthy_endpoints: 1, ..HealthThresholds::default() },
            vec![],
        ));
        let health = pm.pool_health("pool-1").await.unwrap();
        assert_eq!(health.status, PoolStatus::Unhealthy);
        assert!(!health.status.is_routable());
    }

    #[tokio::test]
    async fn pool_health_is_cached() {
        let mgr = manager_with(&["a"]).await;
        let mut pm = PoolManager::new(mgr);
        pm.add_pool(Pool::new(
            "pool-1",
            vec![EndpointRef { id: "a".into(), priority: 1, weight: 1.0 }],
            SelectionPolicy::Priority,
            HealthThresholds::default(),
            vec![],
        ));
        let first = pm.pool_health("pool-1").await.unwrap();
        let second = pm.pool_health("pool-1").await.unwrap();
        assert_eq!(first.computed_at, second.computed_at);
    }
}
