//! Wires a parsed `GatewayConfigDocument` into a running `Router` plus its
//! supporting cast (credential stores, health manager, pools, adapters,
//! event log, health-check scheduler).
//!
//! Grounded in the teacher's `Config::from_env` → `api::serve(config)` flow:
//! there, a flat `Config` struct feeds the axum app directly; here the
//! config document fans out into several long-lived components first, since
//! the dispatch engine has real internal state (circuit breakers, pools,
//! credential cache) that the teacher's stateless proxy didn't need.

use std::sync::Arc;

use reqwest::Client;

use crate::adapters::anthropic::AnthropicAdapter;
use crate::adapters::bedrock::BedrockAdapter;
use crate::adapters::openai::OpenAiAdapter;
use crate::adapters::vllm::VllmAdapter;
use crate::adapters::{http_timeout, AdapterRegistry, ProviderAdapter, ProviderKind};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::{ConfigError, GatewayConfigDocument};
use crate::context::ContextRegistry;
use crate::credentials::{AwsStore, CredentialRef, CredentialResolver, CredentialStore, CredentialStoreConfig, SimpleStore};
use crate::events::{EventLog, GatewayObserver, TracingObserver};
use crate::health::EndpointHealthManager;
use crate::health_check::HealthCheckScheduler;
use crate::pool::{EndpointRef, Pool, PoolManager};
use crate::router::{EndpointConfig, ModelRoute, Router};

/// Everything a running process needs to serve traffic: the populated
/// `Router`, its `EventLog` (also consumed by the admin surface), and a
/// `ContextRegistry` for in-flight deadline bookkeeping. `api::AppState`
/// is built directly from these three.
///
/// The health-check scheduler and its per-endpoint probe tasks are not
/// carried on this struct: `HealthCheckScheduler::schedule` hands each
/// spawned task its own `Arc` clone, so the probes keep running for the
/// life of the process independent of whether anything still holds the
/// scheduler itself (mirroring the credential resolver's sweeper, spawned
/// the same fire-and-forget way below).
pub struct Gateway {
    pub router: Router,
    pub events: Arc<EventLog>,
    pub contexts: ContextRegistry,
}

impl Gateway {
    /// Builds every component named in the document and registers each
    /// endpoint's periodic health probe, but does not start serving HTTP —
    /// that's `api::serve`'s job once the caller has an `Arc<AppState>`.
    pub async fn from_config(doc: &GatewayConfigDocument) -> Result<Self, ConfigError> {
        let client = Client::new();

        let mut credentials = CredentialResolver::new(crate::credentials::ResolverConfig {
            resolution_timeout: std::time::Duration::from_millis(doc.credential_resolution_timeout_ms),
            ..Default::default()
        });
        for (name, store_config) in &doc.credential_stores {
            let reference = CredentialRef::from(name.as_str());
            let store: Arc<dyn CredentialStore> =
                build_store(store_config).map_err(|e| ConfigError::CredentialStore(name.clone(), e))?;
            credentials.register(reference, store);
        }
        let credentials = Arc::new(credentials);
        credentials.clone().spawn_sweeper();

        let health = Arc::new(EndpointHealthManager::new(CircuitBreakerConfig::default()));

        let mut adapters = AdapterRegistry::new();
        for endpoint in &doc.endpoints {
            let adapter = build_adapter(endpoint, client.clone());
            adapters.register(endpoint.id.clone(), adapter);
        }

        let events: Arc<EventLog> = Arc::new(EventLog::new(vec![Arc::new(TracingObserver) as Arc<dyn GatewayObserver>]));

        let mut pools = PoolManager::new(health.clone());
        for pool_doc in &doc.pools {
            let endpoint_refs = pool_doc
                .endpoint_ids
                .iter()
                .filter_map(|id| doc.endpoints.iter().find(|e| &e.id == id))
                .map(|e| EndpointRef { id: e.id.clone(), priority: e.priority, weight: e.weight })
                .collect();
            pools.add_pool(Pool::new(
                pool_doc.id.clone(),
                endpoint_refs,
                pool_doc.selection_policy.into(),
                pool_doc.health_thresholds(),
                pool_doc.fallback_pool_ids.clone(),
            ));
        }

        let health_check_adapters = adapters.clone();
        let mut router = Router::new(pools, health.clone(), credentials.clone(), adapters, events.clone());

        for endpoint in &doc.endpoints {
            let breaker_config = endpoint.circuit_breaker.as_ref().map(CircuitBreakerConfig::from);
            health.register(&endpoint.id, breaker_config).await;
            router
                .register_endpoint(EndpointConfig {
                    id: endpoint.id.clone(),
                    provider_kind: endpoint.provider_kind,
                    credential_ref: CredentialRef::from(endpoint.credential_ref.as_str()),
                    api_base: endpoint.api_base.clone(),
                    upstream_model_name: endpoint.upstream_model_name.clone(),
                    priority: endpoint.priority,
                    weight: endpoint.weight,
                    timeout: http_timeout(std::time::Duration::from_secs(endpoint.timeout_secs)),
                    max_concurrent_requests: endpoint.max_concurrent_requests,
                    ..EndpointConfig::default()
                })
                .await;
        }

        for model in &doc.models {
            router.register_model(ModelRoute {
                name: model.name.clone(),
                primary_pool_id: model.primary_pool_id.clone(),
                fallback_pool_ids: model.fallback_pool_ids.clone(),
            });
        }

        let health_check = Arc::new(HealthCheckScheduler::new(
            (&doc.health_check).into(),
            health,
            credentials,
            health_check_adapters,
            events.clone(),
        ));
        for endpoint in &doc.endpoints {
            let reference = CredentialRef::from(endpoint.credential_ref.as_str());
            health_check.clone().schedule(endpoint.id.clone(), reference).await;
        }

        Ok(Self { router, events, contexts: ContextRegistry::new() })
    }
}

fn build_store(config: &CredentialStoreConfig) -> Result<Arc<dyn CredentialStore>, crate::error::CredentialError> {
    match config {
        CredentialStoreConfig::Simple { .. } => Ok(Arc::new(SimpleStore::new(config)?)),
        CredentialStoreConfig::Aws { .. } => Ok(Arc::new(AwsStore::new(config)?)),
    }
}

/// Builds the right `ProviderAdapter` for an endpoint's `provider_kind`.
/// Bedrock endpoints reuse `api_base` to carry the AWS region (e.g.
/// `us-east-1`) rather than a literal URL, since the Bedrock runtime host is
/// always derived from region + service name, never configured directly.
fn build_adapter(endpoint: &crate::config::EndpointConfigDocument, client: Client) -> Arc<dyn ProviderAdapter> {
    match endpoint.provider_kind {
        ProviderKind::OpenAiCompatible => Arc::new(OpenAiAdapter::new(client, endpoint.api_base.clone())),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(client, endpoint.api_base.clone())),
        ProviderKind::Together | ProviderKind::Runpod | ProviderKind::Custom => {
            Arc::new(VllmAdapter::new(endpoint.provider_kind, client, endpoint.api_base.clone()))
        }
        ProviderKind::BedrockAnthropic
        | ProviderKind::BedrockAmazonTitan
        | ProviderKind::BedrockAmazonNova
        | ProviderKind::BedrockMetaLlama
        | ProviderKind::BedrockMistral
        | ProviderKind::BedrockCohere
        | ProviderKind::BedrockAi21 => Arc::new(BedrockAdapter::new(
            endpoint.provider_kind,
            client,
            endpoint.api_base.clone(),
            endpoint.upstream_model_name.clone(),
        )),
    }
}
