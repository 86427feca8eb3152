//! Bedrock/Nova family (§6.2): `{messages:[{role, content:[{text}]}],
//! inferenceConfig}`.

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
                "content": [{"text": m.content}],
            })
        })
        .collect();

    let mut inference_config = serde_json::Map::new();
    if let Some(t) = req.max_tokens {
        inference_config.insert("maxTokens".to_string(), json!(t));
    }
    if let Some(t) = req.temperature {
        inference_config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        inference_config.insert("topP".to_string(), json!(p));
    }
    if let Some(stop) = &req.stop {
        inference_config.insert("stopSequences".to_string(), json!(stop));
    }

    json!({
        "messages": messages,
        "inferenceConfig": Value::Object(inference_config),
    })
}

pub fn parse_response(json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    let content = json["output"]["message"]["content"]
        .as_array()
        .and_then(|blocks| blocks.first())
        .and_then(|b| b["text"].as_str())
        .ok_or(ErrorKind::Transient)?
        .to_string();

    Ok(ChatResponse {
        id: String::new(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: json["stopReason"].as_str().map(str::to_string),
        }],
        usage: TokenUsage {
            prompt_tokens: json["usage"]["inputTokens"].as_u64().unwrap_or_default() as u32,
            completion_tokens: json["usage"]["outputTokens"].as_u64().unwrap_or_default() as u32,
            total_tokens: json["usage"]["totalTokens"].as_u64().unwrap_or_default() as u32,
        },
    })
}

/// Nova's converse-style stream emits distinct top-level event keys per
/// frame: `messageStart`, `contentBlockDelta` (the only one carrying text),
/// `contentBlockStop`, `messageStop` (carries `stopReason`), and a trailing
/// `metadata` frame with usage. Only the two that carry content are turned
/// into chunks.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    if let Some(text) = payload["contentBlockDelta"]["delta"]["text"].as_str() {
        return Some(single_delta_chunk(model_id, Some(text.to_string()), None));
    }
    if let Some(reason) = payload["messageStop"]["stopReason"].as_str() {
        return Some(single_delta_chunk(model_id, None, Some(reason.to_string())));
    }
    None
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
