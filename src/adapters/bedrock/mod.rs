//! AWS Bedrock adapter family (§4.2, §6.2): one `BedrockAdapter` per
//! endpoint, parameterised by `ProviderKind` to select the family-specific
//! wire translation. SigV4 signing (mandatory on every Bedrock call) lives in
//! `adapters::sigv4`; model id is URL-encoded into the invoke path.

pub mod ai21;
pub mod anthropic;
pub mod cohere;
mod eventstream;
pub mod llama;
pub mod mistral;
pub mod nova;
pub mod titan;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;

use crate::adapters::{classify_status, AdapterResult, Capabilities, ProviderAdapter, ProviderKind};
use crate::context::RequestContext;
use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatResponse, NormalisedRequest};

/// Reshapes the canonical request into the family's wire body. Implemented
/// per family in the sibling modules.
pub fn translate_bedrock(kind: ProviderKind, req: &NormalisedRequest) -> Value {
    match kind {
        ProviderKind::BedrockAnthropic => anthropic::translate(req),
        ProviderKind::BedrockAmazonTitan => titan::translate(req),
        ProviderKind::BedrockAmazonNova => nova::translate(req),
        ProviderKind::BedrockMetaLlama => llama::translate(req),
        ProviderKind::BedrockMistral => mistral::translate(req),
        ProviderKind::BedrockCohere => cohere::translate(req),
        ProviderKind::BedrockAi21 => ai21::translate(req),
        _ => unreachable!("translate_bedrock called with a non-Bedrock ProviderKind"),
    }
}

fn parse_bedrock_response(kind: ProviderKind, json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    match kind {
        ProviderKind::BedrockAnthropic => anthropic::parse_response(json, model_id),
        ProviderKind::BedrockAmazonTitan => titan::parse_response(json, model_id),
        ProviderKind::BedrockAmazonNova => nova::parse_response(json, model_id),
        ProviderKind::BedrockMetaLlama => llama::parse_response(json, model_id),
        ProviderKind::BedrockMistral => mistral::parse_response(json, model_id),
        ProviderKind::BedrockCohere => cohere::parse_response(json, model_id),
        ProviderKind::BedrockAi21 => ai21::parse_response(json, model_id),
        _ => unreachable!("parse_bedrock_response called with a non-Bedrock ProviderKind"),
    }
}

/// Dispatches one decoded event-stream `Event` to the family-specific
/// streaming-chunk parser, returning `None` for events that carry no
/// content delta (message-start/stop markers, metadata-only frames) or that
/// aren't a model-output chunk at all (`modelStreamErrorException` and
/// friends are surfaced as `ErrorKind::Transient` by the caller instead,
/// since the frame still decoded — there's simply nothing to yield).
fn parse_stream_event(kind: ProviderKind, event: &eventstream::Event, model_id: &str) -> Option<ChatChunk> {
    if event.event_type != "chunk" {
        tracing::debug!(event_type = %event.event_type, "bedrock stream signalled a non-chunk event");
        return None;
    }
    match kind {
        ProviderKind::BedrockAnthropic => anthropic::parse_stream_chunk(&event.payload, model_id),
        ProviderKind::BedrockAmazonTitan => titan::parse_stream_chunk(&event.payload, model_id),
        ProviderKind::BedrockAmazonNova => nova::parse_stream_chunk(&event.payload, model_id),
        ProviderKind::BedrockMetaLlama => llama::parse_stream_chunk(&event.payload, model_id),
        ProviderKind::BedrockMistral => mistral::parse_stream_chunk(&event.payload, model_id),
        ProviderKind::BedrockCohere => cohere::parse_stream_chunk(&event.payload, model_id),
        ProviderKind::BedrockAi21 => ai21::parse_stream_chunk(&event.payload, model_id),
        _ => unreachable!("parse_stream_event called with a non-Bedrock ProviderKind"),
    }
}

pub struct BedrockAdapter {
    kind: ProviderKind,
    client: Client,
    region: String,
    model_id: String,
}

impl BedrockAdapter {
    pub fn new(kind: ProviderKind, client: Client, region: impl Into<String>, model_id: impl Into<String>) -> Self {
        assert!(kind.is_bedrock(), "BedrockAdapter requires a Bedrock ProviderKind");
        Self { kind, client, region: region.into(), model_id: model_id.into() }
    }

    fn aws_credential(cred: &Credential) -> AdapterResult<(&str, &str, Option<&str>, &str)> {
        match cred {
            Credential::Aws {
                access_key_id,
                secret_access_key,
                session_token,
                region,
                ..
            } => Ok((access_key_id, secret_access_key, session_token.as_deref(), region)),
            _ => Err(ErrorKind::CredentialError),
        }
    }

    fn host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region)
    }

    fn invoke_path(&self, streaming: bool) -> String {
        let encoded = urlencoding_minimal(&self.model_id);
        if streaming {
            format!("/model/{encoded}/invoke-with-response-stream")
        } else {
            format!("/model/{encoded}/invoke")
        }
    }
}

/// Minimal path-segment percent-encoding, sufficient for Bedrock model ids
/// (`provider.model-version:0`-style strings contain only `.:` beyond
/// alphanumerics, which are safe unencoded in a path segment per RFC 3986
/// but AWS's own SDKs encode `:`). Kept local rather than pulling in a
/// general-purpose URL-encoding crate for one character class.
fn urlencoding_minimal(model_id: &str) -> String {
    model_id.replace(':', "%3A")
}

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            completion: false,
            streaming: true,
            json_mode: false,
            function_calling: matches!(self.kind, ProviderKind::BedrockAnthropic),
            vision: matches!(self.kind, ProviderKind::BedrockAnthropic | ProviderKind::BedrockAmazonNova),
            embeddings: false,
        }
    }

    async fn chat(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<ChatResponse> {
        let (access_key_id, secret_access_key, session_token, _credential_region) = Self::aws_credential(cred)?;
        let body = translate_bedrock(self.kind, req);
        let body_bytes = serde_json::to_vec(&body).map_err(|_| ErrorKind::Transient)?;

        let host = self.host();
        let path = self.invoke_path(false);
        let signed = crate::adapters::sigv4::sign(
            &crate::adapters::sigv4::SigningParams {
                access_key_id,
                secret_access_key,
                session_token,
                region: &self.region,
                service: "bedrock",
            },
            "POST",
            &host,
            &path,
            "",
            &body_bytes,
        );

        let mut builder = self
            .client
            .post(format!("https://{host}{path}"))
            .header("Authorization", signed.authorization)
            .header("X-Amz-Date", signed.amz_date)
            .header("X-Request-Id", ctx.id.clone())
            .header("Content-Type", "application/json")
            .body(body_bytes);
        if let Some(token) = signed.security_token {
            builder = builder.header("X-Amz-Security-Token", token);
        }

        let response = builder.send().await.map_err(|_| ErrorKind::Transient)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let json: Value = response.json().await.map_err(|_| ErrorKind::Transient)?;
        parse_bedrock_response(self.kind, &json, &self.model_id)
    }

    async fn chat_stream(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<ChatChunk>>> {
        let (access_key_id, secret_access_key, session_token, _credential_region) = Self::aws_credential(cred)?;
        let body = translate_bedrock(self.kind, req);
        let body_bytes = serde_json::to_vec(&body).map_err(|_| ErrorKind::Transient)?;

        let host = self.host();
        let path = self.invoke_path(true);
        let signed = crate::adapters::sigv4::sign(
            &crate::adapters::sigv4::SigningParams {
                access_key_id,
                secret_access_key,
                session_token,
                region: &self.region,
                service: "bedrock",
            },
            "POST",
            &host,
            &path,
            "",
            &body_bytes,
        );

        let mut builder = self
            .client
            .post(format!("https://{host}{path}"))
            .header("Authorization", signed.authorization)
            .header("X-Amz-Date", signed.amz_date)
            .header("X-Request-Id", ctx.id.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/vnd.amazon.eventstream")
            .body(body_bytes);
        if let Some(token) = signed.security_token {
            builder = builder.header("X-Amz-Security-Token", token);
        }

        let response = builder.send().await.map_err(|_| ErrorKind::Transient)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let kind = self.kind;
        let model_id = self.model_id.clone();
        let chunks = eventstream::parse(response.bytes_stream()).filter_map(move |event| {
            let model_id = model_id.clone();
            async move {
                match event {
                    Ok(event) => parse_stream_event(kind, &event, &model_id).map(Ok),
                    Err(err) => Some(Err(err)),
                }
            }
        });
        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_colon_is_percent_encoded() {
        assert_eq!(urlencoding_minimal("anthropic.claude-3:0"), "anthropic.claude-3%3A0");
    }
}
