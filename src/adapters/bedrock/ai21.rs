//! Bedrock/AI21 family (§6.2): `{messages, max_tokens, temperature, top_p,
//! stop_sequences?, stream}` — structurally the closest Bedrock family to
//! the OpenAI-compatible shape.

use serde_json::{json, Value};

use crate::adapters::AdapterResult;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, DeltaChoice, NormalisedRequest, Role, TokenUsage};

pub fn translate(req: &NormalisedRequest) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": format!("{:?}", m.role).to_lowercase(),
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::Map::new();
    body.insert("messages".to_string(), json!(messages));
    if let Some(t) = req.max_tokens {
        body.insert("max_tokens".to_string(), json!(t));
    }
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
    let choices_in = json["choices"].as_array().ok_or(ErrorKind::Transient)?;
    let first = choices_in.first().ok_or(ErrorKind::Transient)?;
    let content = first["message"]["content"].as_str().unwrap_or_default().to_string();

    Ok(ChatResponse {
        id: String::new(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: first["finish_reason"].as_str().map(str::to_string),
        }],
        usage: TokenUsage {
            prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or_default() as u32,
            completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or_default() as u32,
            total_tokens: json["usage"]["total_tokens"].as_u64().unwrap_or_default() as u32,
        },
    })
}

/// AI21's Jamba-on-Bedrock streaming events mirror the OpenAI chunk shape
/// directly: `{choices: [{delta: {content}, finish_reason}]}`.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    let first = payload["choices"].as_array()?.first()?;
    let content = first["delta"]["content"].as_str().map(str::to_string);
    let finish_reason = first["finish_reason"].as_str().map(str::to_string);
    if content.is_none() && finish_reason.is_none() {
        return None;
    }
    Some(ChatChunk {
        id: String::new(),
        object: "chat.completion.chunk",
        created: 0,
        model: model_id.to_string(),
        choices: vec![DeltaChoice { index: 0, delta: Delta { role: None, content }, finish_reason }],
    })
}
