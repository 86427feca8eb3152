//! Bedrock/Anthropic family (§6.2): `{anthropic_version, messages, max_tokens,
//! system?, ...}`, `anthropic_version` added and `model` dropped (it's
//! embedded in the invoke URL instead).

use serde_json::{json, Value};

use crate::adapters::{AdapterResult, ProviderKind};
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, DeltaChoice, NormalisedRequest, Role, TokenUsage};

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub fn translate(req: &NormalisedRequest) -> Value {
    use crate::model::Role as R;

    let mut system = None;
    let mut messages = Vec::new();
    for m in &req.messages {
        if matches!(m.role, R::System) && system.is_none() {
            system = Some(m.content.clone());
        } else {
            messages.push(json!({
                "role": format!("{:?}", m.role).to_lowercase(),
                "content": m.content,
            }));
        }
    }

    let mut body = serde_json::Map::new();
    body.insert("anthropic_version".to_string(), json!(ANTHROPIC_VERSION));
    if let Some(system) = system {
        body.insert("system".to_string(), json!(system));
    }
    body.insert("messages".to_string(), json!(messages));
    body.insert("max_tokens".to_string(), json!(req.max_tokens.unwrap_or(4096)));
    if let Some(t) = req.temperature {
        body.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        body.insert("top_p".to_string(), json!(p));
    }
    if let Some(stop) = &req.stop {
        body.insert("stop_sequences".to_string(), json!(stop));
    }
    Value::Object(body)
}

pub fn parse_response(json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    let content = json["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or(ErrorKind::Transient)?
        .to_string();

    Ok(ChatResponse {
        id: json["id"].as_str().unwrap_or_default().to_string(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: json["stop_reason"]
                .as_str()
                .map(crate::adapters::anthropic::map_finish_reason),
        }],
        usage: TokenUsage {
            prompt_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or_default() as u32,
            completion_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or_default() as u32,
            total_tokens: (json["usage"]["input_tokens"].as_u64().unwrap_or_default()
                + json["usage"]["output_tokens"].as_u64().unwrap_or_default()) as u32,
        },
    })
}

/// Re-exported so the adapter and translator both see one `ProviderKind`.
pub const KIND: ProviderKind = ProviderKind::BedrockAnthropic;

/// Streaming events use Anthropic's native `content_block_delta`/
/// `message_delta`/`message_stop` framing (the same event shape as the
/// direct Anthropic API's SSE stream, just delivered over event-stream
/// frames instead). Only `content_block_delta` and `message_delta` carry
/// anything worth yielding; `message_start`/`content_block_start`/
/// `content_block_stop`/`message_stop` are structural markers.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    match payload["type"].as_str()? {
        "content_block_delta" => {
            let text = payload["delta"]["text"].as_str()?.to_string();
            Some(single_delta_chunk(model_id, Some(text), None))
        }
        "message_delta" => {
            let finish_reason = payload["delta"]["stop_reason"]
                .as_str()
                .map(crate::adapters::anthropic::map_finish_reason);
            finish_reason.map(|fr| single_delta_chunk(model_id, None, Some(fr)))
        }
        _ => None,
    }
}

fn single_delta_chunk(model_id: &str, content: Option<String>, finish_reason: Option<String>) -> ChatChunk {
    ChatChunk {
        id: String::new(),
        object: "chat.completion.chunk",
        created: 0,
        model: model_id.to_string(),
        choices: vec![DeltaChoice { index: 0, delta: Delta { role: None, content }, finish_reason }],
    }
}
