//! Bedrock/Cohere family (§6.2): `{message, chat_history[], preamble?,
//! max_tokens, temperature, p, stop_sequences?, stream}`.

use serde_json::{json, Value};

use crate::adapters::AdapterResult;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, DeltaChoice, NormalisedRequest, Role, TokenUsage};

pub fn translate(req: &NormalisedRequest) -> Value {
    let mut preamble = None;
    let mut chat_history = Vec::new();
    let mut last_user_message = String::new();

    for (i, m) in req.messages.iter().enumerate() {
        match m.role {
            Role::System if preamble.is_none() => preamble = Some(m.content.clone()),
            Role::User if i == req.messages.len() - 1 => last_user_message = m.content.clone(),
            _ => chat_history.push(json!({
                "role": cohere_role(m.role),
                "message": m.content,
            })),
        }
    }

    let mut body = serde_json::Map::new();
    body.insert("message".to_string(), json!(last_user_message));
    body.insert("chat_history".to_string(), json!(chat_history));
    if let Some(preamble) = preamble {
        body.insert("preamble".to_string(), json!(preamble));
    }
    if let Some(t) = req.max_tokens {
        body.insert("max_tokens".to_string(), json!(t));
    }
    if let Some(t) = req.temperature {
        body.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        body.insert("p".to_string(), json!(p));
    }
    if let Some(stop) = &req.stop {
        body.insert("stop_sequences".to_string(), json!(stop));
    }
    Value::Object(body)
}

fn cohere_role(role: Role) -> &'static str {
    match role {
        Role::User => "USER",
        Role::Assistant => "CHATBOT",
        Role::System => "SYSTEM",
        Role::Tool => "TOOL",
    }
}

pub fn parse_response(json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    let content = json["text"].as_str().ok_or(ErrorKind::Transient)?.to_string();

    Ok(ChatResponse {
        id: String::new(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: json["finish_reason"].as_str().map(str::to_string),
        }],
        usage: TokenUsage { prompt_tokens: 0, completion_tokens: 0, total_tokens: 0 },
    })
}

/// Streaming events carry `{text, is_finished}`, with the final event also
/// carrying `finish_reason` instead of `text`.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    let content = payload["text"].as_str().filter(|s| !s.is_empty()).map(str::to_string);
    let finish_reason = if payload["is_finished"].as_bool().unwrap_or(false) {
        payload["finish_reason"].as_str().map(str::to_string)
    } else {
        None
    };
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
