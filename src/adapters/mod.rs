//! Provider Adapter layer (§4.2): one adapter instance per `EndpointConfig`,
//! translating the canonical request/response across heterogeneous upstream
//! wire protocols.
//!
//! The registry pattern is grounded in the teacher's `backend/registry.rs`
//! (`BackendRegistry`, a `HashMap<String, Arc<dyn Backend>>`); this module
//! keeps the same trait-object-by-name shape for provider kinds instead of
//! backend kinds.

pub mod anthropic;
pub mod bedrock;
pub mod openai;
pub mod sigv4;
pub mod vllm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatResponse, NormalisedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
    BedrockAnthropic,
    BedrockAmazonTitan,
    BedrockAmazonNova,
    BedrockMetaLlama,
    BedrockMistral,
    BedrockCohere,
    BedrockAi21,
    Together,
    Runpod,
    Custom,
}

impl ProviderKind {
    /// vLLM-family fast path (§4.9): these providers are snake_case-native
    /// and route `enable_thinking`/extra params through `chat_template_kwargs`.
    pub fn is_vllm_family(&self) -> bool {
        matches!(self, ProviderKind::Together | ProviderKind::Runpod | ProviderKind::Custom)
    }

    pub fn is_bedrock(&self) -> bool {
        matches!(
            self,
            ProviderKind::BedrockAnthropic
                | ProviderKind::BedrockAmazonTitan
                | ProviderKind::BedrockAmazonNova
                | ProviderKind::BedrockMetaLlama
                | ProviderKind::BedrockMistral
                | ProviderKind::BedrockCohere
                | ProviderKind::BedrockAi21
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub chat: bool,
    pub completion: bool,
    pub streaming: bool,
    pub json_mode: bool,
    pub function_calling: bool,
    pub vision: bool,
    pub embeddings: bool,
}

/// Outcome of a single adapter call, before the Router/Health Manager fold
/// it into a circuit-breaker `Outcome`.
pub type AdapterResult<T> = Result<T, ErrorKind>;

/// One adapter instance per `EndpointConfig` (§4.2). Implementations own
/// their `reqwest::Client` and know their own wire format; they classify
/// errors but never retry internally — that's the Router's job.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    async fn chat(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<ChatResponse>;

    async fn chat_stream(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<ChatChunk>>>;

    /// Default health probe: a minimal one-token chat call. Adapters whose
    /// upstream exposes a cheaper liveness endpoint should override this.
    async fn health_probe(&self, cred: &Credential, ctx: &RequestContext) -> AdapterResult<()> {
        let probe = NormalisedRequest {
            messages: vec![crate::model::ChatMessage {
                role: crate::model::Role::User,
                content: "ping".to_string(),
                name: None,
                tool_call_id: None,
            }],
            max_tokens: Some(1),
            ..Default::default()
        };
        self.chat(&probe, cred, ctx).await.map(|_| ())
    }
}

/// Classifies an HTTP status into the adapter error taxonomy (§4.2).
/// Shared by every adapter so the mapping stays in one place.
pub fn classify_status(status: u16, body_snippet: &str) -> ErrorKind {
    match status {
        401 | 403 | 404 => ErrorKind::ImmediateFailure,
        429 => ErrorKind::RateLimited,
        400 => {
            let lower = body_snippet.to_ascii_lowercase();
            if lower.contains("content_policy")
                || lower.contains("content policy")
                || lower.contains("model_not_found")
                || lower.contains("validation")
            {
                ErrorKind::ImmediateFailure
            } else {
                ErrorKind::Transient
            }
        }
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Transient,
    }
}

/// Timeout budget applied to the underlying `reqwest` call, derived from the
/// Router's `providerTimeout` (§4.7.iii). Kept as a free function so adapters
/// apply it uniformly rather than re-deriving it.
pub fn http_timeout(provider_timeout: Duration) -> Duration {
    provider_timeout
}

/// By-name registry of configured adapters, mirroring
/// `BackendRegistry::get`/`register` in the teacher.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { adapters: HashMap::new() }
    }

    pub fn register(&mut self, endpoint_id: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(endpoint_id.into(), adapter);
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(endpoint_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vllm_family_matches_expected_kinds() {
        assert!(ProviderKind::Together.is_vllm_family());
        assert!(ProviderKind::Runpod.is_vllm_family());
        assert!(ProviderKind::Custom.is_vllm_family());
        assert!(!ProviderKind::OpenAiCompatible.is_vllm_family());
    }

    #[test]
    fn classify_status_maps_known_codes() {
        assert_eq!(classify_status(404, ""), ErrorKind::ImmediateFailure);
        assert_eq!(classify_status(429, ""), ErrorKind::RateLimited);
        assert_eq!(classify_status(502, ""), ErrorKind::Transient);
        assert_eq!(
            classify_status(400, "content_policy violation"),
            ErrorKind::ImmediateFailure
        );
        assert_eq!(classify_status(400, "bad json"), ErrorKind::Transient);
    }
}
