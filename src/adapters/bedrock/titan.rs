//! Bedrock/Amazon-Titan family (§6.2): collapses messages into `inputText`
//! with a `textGenerationConfig` block.

use serde_json::{json, Value};

use crate::adapters::AdapterResult;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, DeltaChoice, NormalisedRequest, Role, TokenUsage};

pub fn translate(req: &NormalisedRequest) -> Value {
    let input_text = flatten_messages(req);

    let mut config = serde_json::Map::new();
    config.insert(
        "maxTokenCount".to_string(),
        json!(req.max_tokens.unwrap_or(512)),
    );
    if let Some(t) = req.temperature {
        config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        config.insert("topP".to_string(), json!(p));
    }
    if let Some(stop) = &req.stop {
        config.insert("stopSequences".to_string(), json!(stop));
    }

    json!({
        "inputText": input_text,
        "textGenerationConfig": Value::Object(config),
    })
}

fn flatten_messages(req: &NormalisedRequest) -> String {
    req.messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_response(json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    let results = json["results"].as_array().ok_or(ErrorKind::Transient)?;
    let first = results.first().ok_or(ErrorKind::Transient)?;
    let content = first["outputText"].as_str().unwrap_or_default().to_string();

    Ok(ChatResponse {
        id: String::new(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: first["completionReason"].as_str().map(str::to_string),
        }],
        usage: TokenUsage {
            prompt_tokens: json["inputTextTokenCount"].as_u64().unwrap_or_default() as u32,
            completion_tokens: first["tokenCount"].as_u64().unwrap_or_default() as u32,
            total_tokens: (json["inputTextTokenCount"].as_u64().unwrap_or_default()
                + first["tokenCount"].as_u64().unwrap_or_default()) as u32,
        },
    })
}

/// Each streaming event carries `{outputText, index, totalOutputTextTokenCount,
/// completionReason}`; `completionReason` is `null` on every chunk but the
/// last, where it holds the finish reason.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    let content = payload["outputText"].as_str().map(str::to_string);
    let finish_reason = payload["completionReason"].as_str().map(str::to_string);
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
