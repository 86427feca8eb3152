//! Gateway configuration document (§6.3), parsed with `serde_yaml` the same
//! way the teacher's `config.rs` reads its own settings file. Parsing and
//! validation of the *front door's* configuration is out of scope (§1); this
//! is only the document that names credential stores, endpoints, pools, and
//! model→pool mappings that the core needs to build a `Router`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::adapters::ProviderKind;
use crate::circuit_breaker::CircuitBreakerConfig as BreakerConfig;
use crate::credentials::CredentialStoreConfig;
use crate::health_check::HealthCheckConfig;
use crate::pool::{HealthThresholds, SelectionPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file at {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("model '{0}' references unknown pool '{1}'")]
    UnknownPool(String, String),
    #[error("pool '{0}' references unknown endpoint '{1}'")]
    UnknownEndpoint(String, String),
    #[error("endpoint '{0}' references unknown credential '{1}'")]
    UnknownCredential(String, String),
    #[error("credential store '{0}' failed to initialise: {1}")]
    CredentialStore(String, crate::error::CredentialError),
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfigDocument {
    #[serde(default)]
    pub credential_stores: HashMap<String, CredentialStoreConfig>,
    pub endpoints: Vec<EndpointConfigDocument>,
    pub pools: Vec<PoolConfigDocument>,
    pub models: Vec<ModelConfigDocument>,
    #[serde(default)]
    pub health_check: HealthCheckConfigDocument,
    /// `credentialResolutionTimeoutMs` (§4.1): resolution is bounded by
    /// `min(this, ctx.remaining)`.
    #[serde(default = "default_credential_resolution_timeout_ms")]
    pub credential_resolution_timeout_ms: u64,
}

fn default_credential_resolution_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize)]
pub struct EndpointConfigDocument {
    pub id: String,
    pub provider_kind: ProviderKind,
    pub credential_ref: String,
    pub api_base: String,
    #[serde(default)]
    pub upstream_model_name: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: i64,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfigDocument>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct CircuitBreakerConfigDocument {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_monitoring_window_secs")]
    pub monitoring_window_secs: u64,
    #[serde(default = "default_min_requests_threshold")]
    pub min_requests_threshold: u32,
    #[serde(default = "default_error_threshold_percentage")]
    pub error_threshold_percentage: f64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_monitoring_window_secs() -> u64 {
    60
}
fn default_min_requests_threshold() -> u32 {
    10
}
fn default_error_threshold_percentage() -> f64 {
    50.0
}

impl From<&CircuitBreakerConfigDocument> for BreakerConfig {
    fn from(doc: &CircuitBreakerConfigDocument) -> Self {
        BreakerConfig {
            failure_threshold: doc.failure_threshold,
            min_requests_threshold: doc.min_requests_threshold,
            error_threshold_percentage: doc.error_threshold_percentage,
            monitoring_window: Duration::from_secs(doc.monitoring_window_secs),
            reset_timeout: Duration::from_secs(doc.reset_timeout_secs),
            ..BreakerConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoolConfigDocument {
    pub id: String,
    pub endpoint_ids: Vec<String>,
    #[serde(default = "default_selection_policy")]
    pub selection_policy: SelectionPolicyDocument,
    #[serde(default)]
    pub min_healthy_endpoints: Option<usize>,
    #[serde(default)]
    pub response_time_threshold_ms: Option<u64>,
    #[serde(default)]
    pub error_rate_threshold: Option<f64>,
    #[serde(default)]
    pub fallback_pool_ids: Vec<String>,
}

fn default_selection_policy() -> SelectionPolicyDocument {
    SelectionPolicyDocument::Priority
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicyDocument {
    Priority,
    Weighted,
    RoundRobin,
    LeastLatency,
}

impl From<SelectionPolicyDocument> for SelectionPolicy {
    fn from(doc: SelectionPolicyDocument) -> Self {
        match doc {
            SelectionPolicyDocument::Priority => SelectionPolicy::Priority,
            SelectionPolicyDocument::Weighted => SelectionPolicy::Weighted,
            SelectionPolicyDocument::RoundRobin => SelectionPolicy::RoundRobin,
            SelectionPolicyDocument::LeastLatency => SelectionPolicy::LeastLatency,
        }
    }
}

impl PoolConfigDocument {
    pub fn health_thresholds(&self) -> HealthThresholds {
        let defaults = HealthThresholds::default();
        HealthThresholds {
            min_healthy_endpoints: self.min_healthy_endpoints.unwrap_or(defaults.min_healthy_endpoints),
            response_time_threshold: self
                .response_time_threshold_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.response_time_threshold),
            error_rate_threshold: self.error_rate_threshold.unwrap_or(defaults.error_rate_threshold),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelConfigDocument {
    pub name: String,
    pub primary_pool_id: String,
    #[serde(default)]
    pub fallback_pool_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HealthCheckConfigDocument {
    #[serde(default = "default_hc_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_hc_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_hc_interval_secs() -> u64 {
    30
}
fn default_hc_timeout_secs() -> u64 {
    5
}

impl Default for HealthCheckConfigDocument {
    fn default() -> Self {
        Self { interval_secs: default_hc_interval_secs(), timeout_secs: default_hc_timeout_secs() }
    }
}

impl From<&HealthCheckConfigDocument> for HealthCheckConfig {
    fn from(doc: &HealthCheckConfigDocument) -> Self {
        HealthCheckConfig {
            interval: Duration::from_secs(doc.interval_secs),
            timeout: Duration::from_secs(doc.timeout_secs),
        }
    }
}

impl GatewayConfigDocument {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let doc: GatewayConfigDocument = serde_yaml::from_str(contents)?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Self::from_yaml_str(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let endpoint_ids: std::collections::HashSet<&str> =
            self.endpoints.iter().map(|e| e.id.as_str()).collect();
        let pool_ids: std::collections::HashSet<&str> = self.pools.iter().map(|p| p.id.as_str()).collect();

        for endpoint in &self.endpoints {
            if !self.credential_stores.contains_key(&endpoint.credential_ref) {
                return Err(ConfigError::UnknownCredential(
                    endpoint.id.clone(),
                    endpoint.credential_ref.clone(),
                ));
            }
        }

        for pool in &self.pools {
            for endpoint_id in &pool.endpoint_ids {
                if !endpoint_ids.contains(endpoint_id.as_str()) {
                    return Err(ConfigError::UnknownEndpoint(pool.id.clone(), endpoint_id.clone()));
                }
            }
            for fallback in &pool.fallback_pool_ids {
                if !pool_ids.contains(fallback.as_str()) {
                    return Err(ConfigError::UnknownPool(pool.id.clone(), fallback.clone()));
                }
            }
        }

        for model in &self.models {
            if !pool_ids.contains(model.primary_pool_id.as_str()) {
                return Err(ConfigError::UnknownPool(model.name.clone(), model.primary_pool_id.clone()));
            }
            for fallback in &model.fallback_pool_ids {
                if !pool_ids.contains(fallback.as_str()) {
                    return Err(ConfigError::UnknownPool(model.name.clone(), fallback.clone()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
credential_stores:
  openai-key:
    type: simple
    source:
      type: env
      api_key_var: OPENAI_API_KEY
endpoints:
  - id: openai-primary
    provider_kind: openai-compatible
    credential_ref: openai-key
    api_base: https://api.openai.com
pools:
  - id: pool-a
    endpoint_ids: [openai-primary]
models:
  - name: gpt-4o
    primary_pool_id: pool-a
"#;

    #[test]
    fn parses_minimal_document() {
        let doc = GatewayConfigDocument::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(doc.endpoints.len(), 1);
        assert_eq!(doc.pools.len(), 1);
        assert_eq!(doc.models[0].primary_pool_id, "pool-a");
    }

    #[test]
    fn rejects_pool_referencing_unknown_endpoint() {
        let bad = SAMPLE.replace("openai-primary]", "openai-primary, ghost]");
        let err = GatewayConfigDocument::from_yaml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEndpoint(_, _)));
    }

    #[test]
    fn rejects_endpoint_referencing_unknown_credential() {
        let bad = SAMPLE.replace("credential_ref: openai-key", "credential_ref: ghost-key");
        let err = GatewayConfigDocument::from_yaml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCredential(_, _)));
    }

    #[test]
    fn rejects_model_referencing_unknown_pool() {
        let bad = SAMPLE.replace("primary_pool_id: pool-a", "primary_pool_id: ghost-pool");
        let err = GatewayConfigDocument::from_yaml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPool(_, _)));
    }
}
