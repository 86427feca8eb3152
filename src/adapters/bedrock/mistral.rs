//! Bedrock/Mistral family (§6.2): `{prompt, max_tokens, temperature, top_p,
//! stop?, stream}`.

use serde_json::{json, Value};

use crate::adapters::AdapterResult;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, DeltaChoice, NormalisedRequest, Role, TokenUsage};

fn to_instruct_prompt(req: &NormalisedRequest) -> String {
    let mut prompt = String::new();
    for m in &req.messages {
        match m.role {
            Role::System | Role::User => prompt.push_str(&format!("[INST] {} [/INST]", m.content)),
            Role::Assistant => prompt.push_str(&m.content),
            Role::Tool => prompt.push_str(&m.content),
        }
    }
    prompt
}

pub fn translate(req: &NormalisedRequest) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("prompt".to_string(), json!(to_instruct_prompt(req)));
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
        body.insert("stop".to_string(), json!(stop));
    }
    Value::Object(body)
}

pub fn parse_response(json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    let outputs = json["outputs"].as_array().ok_or(ErrorKind::Transient)?;
    let first = outputs.first().ok_or(ErrorKind::Transient)?;
    let content = first["text"].as_str().unwrap_or_default().to_string();

    Ok(ChatResponse {
        id: String::new(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: first["stop_reason"].as_str().map(str::to_string),
        }],
        usage: TokenUsage { prompt_tokens: 0, completion_tokens: 0, total_tokens: 0 },
    })
}

/// Each streaming event carries the same `outputs[]` shape as the
/// non-streaming response, one entry with incremental `text`.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    let first = payload["outputs"].as_array()?.first()?;
    let content = first["text"].as_str().filter(|s| !s.is_empty()).map(str::to_string);
    let finish_reason = first["stop_reason"].as_str().map(str::to_string);
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
