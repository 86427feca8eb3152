//! Router (§4.7): maps model name → pool chain and executes a request across
//! pools with bounded per-endpoint concurrency and fallback.
//!
//! Grounded in the teacher's `api/proxy.rs` `chat_completions` waterfall
//! handler, which loops a chain of provider entries, tries each, records
//! cooldowns/fallback events on failure, and returns on first success. This
//! module generalizes that loop into the spec's pool-then-endpoint
//! two-level iteration with a real circuit breaker and bounded concurrency
//! counter underneath, instead of a flat per-account cooldown map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::adapters::{AdapterRegistry, ProviderKind};
use crate::context::RequestContext;
use crate::credentials::{CredentialRef, CredentialResolver};
use crate::error::{ErrorKind, GatewayError};
use crate::events::{EventLog, GatewayEvent};
use crate::health::EndpointHealthManager;
use crate::model::{ChatChunk, ChatResponse, NormalisedRequest};
use crate::pool::PoolManager;

/// Immutable per-endpoint configuration (§3). Created at startup, destroyed
/// at shutdown; never mutated in place.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub id: String,
    pub provider_kind: ProviderKind,
    pub credential_ref: CredentialRef,
    pub api_base: String,
    pub upstream_model_name: String,
    pub priority: u32,
    pub weight: f64,
    pub timeout: Duration,
    pub max_concurrent_requests: i64,
    pub provider_timeout_multiplier: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            provider_kind: ProviderKind::OpenAiCompatible,
            credential_ref: CredentialRef::from(""),
            api_base: String::new(),
            upstream_model_name: String::new(),
            priority: 0,
            weight: 1.0,
            timeout: Duration::from_secs(120),
            max_concurrent_requests: 50,
            provider_timeout_multiplier: 0.8,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub name: String,
    pub primary_pool_id: String,
    pub fallback_pool_ids: Vec<String>,
}

/// Either a complete response or the start of a stream; the Router doesn't
/// care which once an endpoint has committed to an outcome.
pub enum RouterResponse {
    Complete(ChatResponse),
    Stream(futures::stream::BoxStream<'static, Result<ChatChunk, ErrorKind>>),
}

pub struct RouterOutcome {
    pub response: RouterResponse,
    pub endpoint_id: String,
    pub pool_id: String,
    pub used_fallback: bool,
    pub routing_time: Duration,
}

/// CAS-guarded per-endpoint in-flight counter with the self-healing clamp
/// §4.7/§9 mandates: negative counts clamp to 0, pathological counts cap to
/// `max_concurrent_requests`, both logged.
struct ConcurrencyGuard<'a> {
    counter: &'a AtomicI64,
    endpoint_id: &'a str,
}

impl<'a> ConcurrencyGuard<'a> {
    fn acquire(counter: &'a AtomicI64, endpoint_id: &'a str, max: i64) -> Option<Self> {
        self_heal(counter, endpoint_id, max);
        loop {
            let current = counter.load(Ordering::SeqCst);
            if current >= max {
                return None;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(Self { counter, endpoint_id });
            }
        }
    }
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn self_heal(counter: &AtomicI64, endpoint_id: &str, max: i64) {
    let value = counter.load(Ordering::SeqCst);
    if value < 0 {
        warn!(endpoint_id, value, "negative concurrency counter clamped to 0");
        counter.store(0, Ordering::SeqCst);
    } else if value > max.saturating_mul(2) {
        warn!(endpoint_id, value, max, "pathological concurrency counter capped");
        counter.store(max, Ordering::SeqCst);
    }
}

pub struct Router {
    endpoints: HashMap<String, EndpointConfig>,
    models: HashMap<String, ModelRoute>,
    pools: PoolManager,
    health: Arc<EndpointHealthManager>,
    credentials: Arc<CredentialResolver>,
    adapters: AdapterRegistry,
    events: Arc<EventLog>,
    concurrency: HashMap<String, AtomicI64>,
}

impl Router {
    pub fn new(
        pools: PoolManager,
        health: Arc<EndpointHealthManager>,
        credentials: Arc<CredentialResolver>,
        adapters: AdapterRegistry,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            endpoints: HashMap::new(),
            models: HashMap::new(),
            pools,
            health,
            credentials,
            adapters,
            events,
            concurrency: HashMap::new(),
        }
    }

    pub async fn register_endpoint(&mut self, config: EndpointConfig) {
        self.health.register(&config.id, None).await;
        self.concurrency.insert(config.id.clone(), AtomicI64::new(0));
        self.endpoints.insert(config.id.clone(), config);
    }

    pub fn register_model(&mut self, route: ModelRoute) {
        self.models.insert(route.name.clone(), route);
    }

    /// Read-only accessors for the admin HTTP surface (§6.1's demonstration
    /// endpoints, see `api::routes`).
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    pub async fn pool_health(&self, pool_id: &str) -> Option<crate::pool::PoolHealth> {
        self.pools.pool_health(pool_id).await
    }

    pub async fn endpoint_state(&self, endpoint_id: &str) -> Option<crate::circuit_breaker::State> {
        self.health.state(endpoint_id).await
    }

    /// `execute(modelName, normalisedRequest, ctx)` (§4.7). Streaming
    /// dispatch shares the same pool/endpoint iteration; only the final
    /// adapter call differs (`chat` vs `chat_stream`), selected by
    /// `req.stream`.
    pub async fn execute(
        &self,
        model_name: &str,
        req: &NormalisedRequest,
        ctx: &RequestContext,
    ) -> Result<RouterOutcome, GatewayError> {
        let started = std::time::Instant::now();

        let route = self.models.get(model_name).ok_or_else(|| GatewayError::ModelUnknown {
            model: model_name.to_string(),
            request_id: ctx.id.clone(),
        })?;

        let mut pool_chain = vec![route.primary_pool_id.clone()];
        pool_chain.extend(route.fallback_pool_ids.clone());

        let mut attempted = 0u32;
        let mut last_error: Option<GatewayError> = None;
        let mut used_fallback = false;

        for pool_id in &pool_chain {
            if ctx.remaining() < Duration::from_secs(1) {
                return Err(GatewayError::Timeout {
                    elapsed_ms: ctx.elapsed().as_millis() as u64,
                    timeout_ms: (ctx.elapsed() + ctx.remaining()).as_millis() as u64,
                    request_id: ctx.id.clone(),
                });
            }

            let candidates = self.pools.select_endpoints(pool_id).await;
            if candidates.is_empty() {
                continue;
            }

            for endpoint_id in &candidates {
                if ctx.is_cancelled() {
                    return Err(GatewayError::Cancelled {
                        reason: ctx.cancellation_token().reason().await.unwrap_or_default(),
                        request_id: ctx.id.clone(),
                    });
                }

                let Some(endpoint) = self.endpoints.get(endpoint_id) else { continue };

                if !self.health.is_available(endpoint_id).await {
                    continue;
                }

                let Some(counter) = self.concurrency.get(endpoint_id) else { continue };
                let Some(_guard) = ConcurrencyGuard::acquire(counter, endpoint_id, endpoint.max_concurrent_requests)
                else {
                    continue;
                };

                let provider_timeout = clamp_duration(
                    ctx.remaining().mul_f64(endpoint.provider_timeout_multiplier),
                    endpoint.min_timeout,
                    endpoint.max_timeout,
                );

                // §4.1: resolution is bounded by
                // `min(credentialResolutionTimeoutMs, ctx.remaining)`.
                let credential_budget = self.credentials.resolution_timeout().min(ctx.remaining());
                let credential = match self
                    .credentials
                    .resolve(&endpoint.credential_ref, credential_budget)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        attempted += 1;
                        last_error = Some(GatewayError::CredentialError {
                            endpoint_id: endpoint_id.clone(),
                            message: e.to_string(),
                            request_id: ctx.id.clone(),
                        });
                        continue;
                    }
                };

                let Some(adapter) = self.adapters.get(endpoint_id) else { continue };

                let child_ctx = ctx.clone();
                let result = self
                    .health
                    .execute(endpoint_id, provider_timeout, ctx.remaining(), |_deadline| {
                        let adapter = adapter.clone();
                        let req = req.clone();
                        let credential = credential.clone();
                        let child_ctx = child_ctx.clone();
                        async move {
                            if req.stream {
                                adapter
                                    .chat_stream(&req, &credential, &child_ctx)
                                    .await
                                    .map(RouterResponse::Stream)
                            } else {
                                adapter.chat(&req, &credential, &child_ctx).await.map(RouterResponse::Complete)
                            }
                        }
                    })
                    .await;

                attempted += 1;

                match result {
                    Ok(response) => {
                        return Ok(RouterOutcome {
                            response,
                            endpoint_id: endpoint_id.clone(),
                            pool_id: pool_id.clone(),
                            used_fallback,
                            routing_time: started.elapsed(),
                        });
                    }
                    Err(kind) => {
                        used_fallback = true;
                        self.events
                            .record(GatewayEvent::EndpointFallback {
                                request_id: ctx.id.clone(),
                                model: model_name.to_string(),
                                from_endpoint_id: Some(endpoint_id.clone()),
                                to_endpoint_id: endpoint_id.clone(),
                                reason: kind,
                                at: chrono::Utc::now(),
                            })
                            .await;
                        last_error = Some(kind_to_error(kind, endpoint_id, &ctx.id));
                        // immediate-failure: do not retry this endpoint; breaker already
                        // tripped inside health.execute(). transient/rate-limited/timeout:
                        // same behavior — move to the next endpoint in this pool (§4.7.viii/ix).
                        continue;
                    }
                }
            }
        }

        self.events
            .record(GatewayEvent::AllEndpointsExhausted {
                request_id: ctx.id.clone(),
                model: model_name.to_string(),
                attempted,
                at: chrono::Utc::now(),
            })
            .await;

        Err(GatewayError::AllEndpointsExhausted {
            model: model_name.to_string(),
            last_error: last_error.map(|e| e.to_string()).unwrap_or_else(|| "no endpoints available".to_string()),
            request_id: ctx.id.clone(),
        })
    }
}

fn clamp_duration(value: Duration, min: Duration, max: Duration) -> Duration {
    value.clamp(min, max)
}

fn kind_to_error(kind: ErrorKind, endpoint_id: &str, request_id: &str) -> GatewayError {
    match kind {
        ErrorKind::Timeout => GatewayError::Timeout {
            elapsed_ms: 0,
            timeout_ms: 0,
            request_id: request_id.to_string(),
        },
        ErrorKind::CircuitOpen => GatewayError::CircuitOpen {
            endpoint_id: endpoint_id.to_string(),
            request_id: request_id.to_string(),
        },
        ErrorKind::RateLimited => GatewayError::RateLimited {
            endpoint_id: endpoint_id.to_string(),
            message: "rate limited".to_string(),
            request_id: request_id.to_string(),
        },
        ErrorKind::ImmediateFailure => GatewayError::ImmediateFailure {
            endpoint_id: endpoint_id.to_string(),
            message: "immediate failure".to_string(),
            request_id: request_id.to_string(),
        },
        ErrorKind::CredentialError => GatewayError::CredentialError {
            endpoint_id: endpoint_id.to_string(),
            message: "credential error".to_string(),
            request_id: request_id.to_string(),
        },
        _ => GatewayError::Transient {
            endpoint_id: endpoint_id.to_string(),
            message: "transient upstream error".to_string(),
            request_id: request_id.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_guard_rejects_at_capacity() {
        let counter = AtomicI64::new(2);
        let guard = ConcurrencyGuard::acquire(&counter, "ep", 2);
        assert!(guard.is_none());
    }

    #[test]
    fn concurrency_guard_releases_on_drop() {
        let counter = AtomicI64::new(0);
        {
            let _guard = ConcurrencyGuard::acquire(&counter, "ep", 2).unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn self_heal_clamps_negative_counter() {
        let counter = AtomicI64::new(-5);
        self_heal(&counter, "ep", 10);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn self_heal_caps_pathological_counter() {
        let counter = AtomicI64::new(1000);
        self_heal(&counter, "ep", 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn clamp_duration_respects_bounds() {
        let d = clamp_duration(Duration::from_secs(1000), Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(d, Duration::from_secs(300));
        let d = clamp_duration(Duration::from_millis(10), Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(d, Duration::from_secs(1));
    }
}
