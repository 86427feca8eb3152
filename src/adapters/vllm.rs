//! vLLM-family adapter: `together`, `runpod`, `custom` (§4.2, §4.9).
//!
//! These are snake_case-native OpenAI-compatible wire formats; the only
//! translation difference from `openai.rs` is that `enable_thinking` and any
//! `providerOverrides.chat_template_kwargs` fold under a single
//! `chat_template_kwargs` object rather than being emitted top-level.

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;

use crate::adapters::openai::post_chat_stream;
use crate::adapters::{classify_status, AdapterResult, Capabilities, ProviderAdapter, ProviderKind};
use crate::context::RequestContext;
use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatResponse, NormalisedRequest};
use crate::translator::translate;

pub struct VllmAdapter {
    kind: ProviderKind,
    client: Client,
    api_base: String,
}

impl VllmAdapter {
    pub fn new(kind: ProviderKind, client: Client, api_base: impl Into<String>) -> Self {
        assert!(kind.is_vllm_family(), "VllmAdapter requires a vLLM-family ProviderKind");
        Self { kind, client, api_base: api_base.into() }
    }

    fn auth_header(cred: &Credential) -> AdapterResult<(String, String)> {
        match cred {
            Credential::Simple { api_key, .. } => {
                Ok(("Authorization".to_string(), format!("Bearer {api_key}")))
            }
            Credential::Bearer { token, .. } => {
                Ok(("Authorization".to_string(), format!("Bearer {token}")))
            }
            Credential::Aws { .. } => Err(ErrorKind::CredentialError),
        }
    }
}

#[async_trait]
impl ProviderAdapter for VllmAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            completion: true,
            streaming: true,
            json_mode: true,
            function_calling: false,
            vision: false,
            embeddings: false,
        }
    }

    async fn chat(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<ChatResponse> {
        let (header_name, header_value) = Self::auth_header(cred)?;
        let body = translate(self.kind, req);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_base))
            .header(header_name, header_value)
            .header("X-Request-Id", ctx.id.clone())
            .json(&body)
            .send()
            .await
            .map_err(|_| ErrorKind::Transient)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let json: serde_json::Value = response.json().await.map_err(|_| ErrorKind::Transient)?;
        crate::adapters::openai::parse_chat_response(&json)
    }

    async fn chat_stream(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<ChatChunk>>> {
        // Streaming framing is identical to the OpenAI family; only the
        // request body construction differs, so the SSE parser is shared
        // via `post_chat_stream`, but the body must still go through this
        // family's own translation (`enable_thinking`/`chat_template_kwargs`)
        // rather than the OpenAI-compatible fast path.
        let (header_name, header_value) = Self::auth_header(cred)?;
        let body = translate(self.kind, req);
        post_chat_stream(&self.client, &self.api_base, header_name, header_value, body, &ctx.id).await
    }
}
