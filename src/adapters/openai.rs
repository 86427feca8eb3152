//! OpenAI-compatible adapter (§4.2, §6.2): canonical fields pass through
//! unchanged; this is the fast-path family referenced in §4.9.
//!
//! Grounded in the teacher's `api/proxy.rs` waterfall handler, which builds a
//! `reqwest::Client` request against `apiBase + "/v1/chat/completions"` with
//! a bearer `Authorization` header and streams the SSE body back.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;

use crate::adapters::{classify_status, AdapterResult, Capabilities, ProviderAdapter, ProviderKind};
use crate::context::RequestContext;
use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, NormalisedRequest, Role, TokenUsage};
use crate::translator::translate;

pub struct OpenAiAdapter {
    client: Client,
    api_base: String,
}

impl OpenAiAdapter {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self { client, api_base: api_base.into() }
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
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            completion: true,
            streaming: true,
            json_mode: true,
            function_calling: true,
            vision: true,
            embeddings: true,
        }
    }

    async fn chat(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<ChatResponse> {
        let (header_name, header_value) = Self::auth_header(cred)?;
        let body = translate(ProviderKind::OpenAiCompatible, req);

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
        parse_chat_response(&json)
    }

    async fn chat_stream(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<ChatChunk>>> {
        let (header_name, header_value) = Self::auth_header(cred)?;
        let body = translate(ProviderKind::OpenAiCompatible, req);
        post_chat_stream(&self.client, &self.api_base, header_name, header_value, body, &ctx.id).await
    }
}

/// Posts an already-translated body to `{api_base}/v1/chat/completions` with
/// `stream: true` and parses the SSE response into canonical chunks. Shared
/// by the plain OpenAI adapter and the vLLM family, which differ only in how
/// the outbound body is translated (`translator::translate` dispatches on
/// `ProviderKind`) — the request/response plumbing and SSE framing are
/// identical across both.
pub(crate) async fn post_chat_stream(
    client: &Client,
    api_base: &str,
    header_name: String,
    header_value: String,
    mut body: serde_json::Value,
    request_id: &str,
) -> AdapterResult<BoxStream<'static, AdapterResult<ChatChunk>>> {
    body["stream"] = serde_json::Value::Bool(true);

    let response = client
        .post(format!("{api_base}/v1/chat/completions"))
        .header(header_name, header_value)
        .header("X-Request-Id", request_id.to_string())
        .json(&body)
        .send()
        .await
        .map_err(|_| ErrorKind::Transient)?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &text));
    }

    let byte_stream = response.bytes_stream();
    let chunk_stream = sse_to_chunks(byte_stream);
    Ok(chunk_stream.boxed())
}

/// Parses an SSE byte stream (`data: <json>\n\n`, terminated by
/// `data: [DONE]`) into canonical chunks. Malformed lines are logged and
/// skipped (§4.2) rather than aborting the stream.
fn sse_to_chunks(
    byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures::Stream<Item = AdapterResult<ChatChunk>> + Send + 'static {
    let lines = async_stream::stream! {
        let mut buf = String::new();
        futures::pin_mut!(byte_stream);
        while let Some(next) = byte_stream.next().await {
            let bytes = match next {
                Ok(b) => b,
                Err(_) => {
                    yield Err(ErrorKind::Transient);
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find("\n\n") {
                let event = buf[..pos].to_string();
                buf.drain(..pos + 2);
                for line in event.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<serde_json::Value>(data) {
                            Ok(json) => match parse_chat_chunk(&json) {
                                Ok(chunk) => yield Ok(chunk),
                                Err(_) => tracing::debug!("skipping malformed SSE chunk"),
                            },
                            Err(_) => tracing::debug!("skipping unparseable SSE line"),
                        }
                    }
                }
            }
        }
    };
    lines
}

pub(crate) fn parse_chat_response(json: &serde_json::Value) -> AdapterResult<ChatResponse> {
    let choices = json["choices"]
        .as_array()
        .ok_or(ErrorKind::Transient)?
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let message = &c["message"];
            Choice {
                index: i as u32,
                message: ChatMessage {
                    role: Role::Assistant,
                    content: message["content"].as_str().unwrap_or_default().to_string(),
                    name: None,
                    tool_call_id: None,
                },
                finish_reason: c["finish_reason"].as_str().map(str::to_string),
            }
        })
        .collect();

    Ok(ChatResponse {
        id: json["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion",
        created: json["created"].as_i64().unwrap_or_default(),
        model: json["model"].as_str().unwrap_or_default().to_string(),
        choices,
        usage: TokenUsage {
            prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or_default() as u32,
            completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or_default() as u32,
            total_tokens: json["usage"]["total_tokens"].as_u64().unwrap_or_default() as u32,
        },
    })
}

fn parse_chat_chunk(json: &serde_json::Value) -> AdapterResult<ChatChunk> {
    use crate::model::{Delta, DeltaChoice};
    let choices = json["choices"]
        .as_array()
        .ok_or(ErrorKind::Transient)?
        .iter()
        .enumerate()
        .map(|(i, c)| DeltaChoice {
            index: i as u32,
            delta: Delta {
                role: None,
                content: c["delta"]["content"].as_str().map(str::to_string),
            },
            finish_reason: c["finish_reason"].as_str().map(str::to_string),
        })
        .collect();

    Ok(ChatChunk {
        id: json["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion.chunk",
        created: json["created"].as_i64().unwrap_or_default(),
        model: json["model"].as_str().unwrap_or_default().to_string(),
        choices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_chat_response() {
        let json = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        });
        let response = parse_chat_response(&json).unwrap();
        assert_eq!(response.choices[0].message.content, "hi");
        assert_eq!(response.usage.total_tokens, 4);
    }

    #[test]
    fn missing_choices_is_transient() {
        let json = serde_json::json!({"id": "x"});
        assert_eq!(parse_chat_response(&json), Err(ErrorKind::Transient));
    }
}
