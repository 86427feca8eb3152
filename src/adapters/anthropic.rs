//! Anthropic adapter (§4.2, §6.2): splits the system message out of the
//! messages array, renames `maxTokens → max_tokens`, and authenticates with
//! `x-api-key` rather than a bearer token.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;

use crate::adapters::{classify_status, AdapterResult, Capabilities, ProviderAdapter, ProviderKind};
use crate::context::RequestContext;
use crate::credentials::Credential;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, NormalisedRequest, Role, TokenUsage};
use crate::translator::translate;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    api_base: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self { client, api_base: api_base.into() }
    }

    fn api_key(cred: &Credential) -> AdapterResult<String> {
        match cred {
            Credential::Simple { api_key, .. } => Ok(api_key.clone()),
            Credential::Bearer { token, .. } => Ok(token.clone()),
            Credential::Aws { .. } => Err(ErrorKind::CredentialError),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            completion: false,
            streaming: true,
            json_mode: false,
            function_calling: true,
            vision: true,
            embeddings: false,
        }
    }

    async fn chat(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<ChatResponse> {
        let api_key = Self::api_key(cred)?;
        let body = translate(ProviderKind::Anthropic, req);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
        parse_message_response(&json)
    }

    async fn chat_stream(
        &self,
        req: &NormalisedRequest,
        cred: &Credential,
        ctx: &RequestContext,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<ChatChunk>>> {
        let api_key = Self::api_key(cred)?;
        let mut body = translate(ProviderKind::Anthropic, req);
        body["stream"] = serde_json::Value::Bool(true);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

        let byte_stream = response.bytes_stream();
        // Anthropic's content_block_delta events don't echo the model name
        // (unlike the initial message_start event); NormalisedRequest itself
        // carries no model field either (§3), so chunks report it empty.
        let chunk_stream = sse_to_chunks(byte_stream, String::new());
        Ok(chunk_stream.boxed())
    }
}

fn sse_to_chunks(
    byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
    model: String,
) -> impl futures::Stream<Item = AdapterResult<ChatChunk>> + Send + 'static {
    async_stream::stream! {
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
                let mut event_type = None;
                let mut data_line = None;
                for line in event.lines() {
                    if let Some(t) = line.strip_prefix("event: ") {
                        event_type = Some(t.to_string());
                    } else if let Some(d) = line.strip_prefix("data: ") {
                        data_line = Some(d.to_string());
                    }
                }
                if event_type.as_deref() != Some("content_block_delta") {
                    continue;
                }
                let Some(data) = data_line else { continue };
                match serde_json::from_str::<serde_json::Value>(&data) {
                    Ok(json) => {
                        let text = json["delta"]["text"].as_str().unwrap_or_default().to_string();
                        yield Ok(ChatChunk {
                            id: String::new(),
                            object: "chat.completion.chunk",
                            created: 0,
                            model: model.clone(),
                            choices: vec![crate::model::DeltaChoice {
                                index: 0,
                                delta: crate::model::Delta { role: None, content: Some(text) },
                                finish_reason: None,
                            }],
                        });
                    }
                    Err(_) => tracing::debug!("skipping malformed Anthropic SSE event"),
                }
            }
        }
    }
}

/// Finish-reason mapping per §4.2 (`end_turn → stop`, `max_tokens → length`).
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn parse_message_response(json: &serde_json::Value) -> AdapterResult<ChatResponse> {
    let content = json["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .unwrap_or_default()
        .to_string();

    let finish_reason = json["stop_reason"].as_str().map(map_finish_reason);

    Ok(ChatResponse {
        id: json["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion",
        created: 0,
        model: json["model"].as_str().unwrap_or_default().to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content,
                name: None,
                tool_call_id: None,
            },
            finish_reason,
        }],
        usage: TokenUsage {
            prompt_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or_default() as u32,
            completion_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or_default() as u32,
            total_tokens: (json["usage"]["input_tokens"].as_u64().unwrap_or_default()
                + json["usage"]["output_tokens"].as_u64().unwrap_or_default()) as u32,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping_matches_spec_table() {
        assert_eq!(map_finish_reason("end_turn"), "stop");
        assert_eq!(map_finish_reason("max_tokens"), "length");
        assert_eq!(map_finish_reason("tool_use"), "tool_calls");
    }

    #[test]
    fn parses_text_block_from_message_response() {
        let json = serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-opus",
            "stop_reason": "end_turn",
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 10, "output_tokens": 2},
        });
        let response = parse_message_response(&json).unwrap();
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 12);
    }
}
