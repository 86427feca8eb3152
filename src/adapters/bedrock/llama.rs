//! Bedrock/Meta-Llama family (§6.2): flattens messages into a Llama instruct
//! prompt template, `{prompt, max_gen_len, temperature, top_p, stream}`.

use serde_json::{json, Value};

use crate::adapters::AdapterResult;
use crate::error::ErrorKind;
use crate::model::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, DeltaChoice, NormalisedRequest, Role, TokenUsage};

/// The Llama 3 instruct chat template, using the header tokens the model was
/// instruction-tuned on.
fn to_instruct_prompt(req: &NormalisedRequest) -> String {
    let mut prompt = String::from("<|begin_of_text|>");
    for m in &req.messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        prompt.push_str(&format!(
            "<|start_header_id|>{role}<|end_header_id|>\n\n{}<|eot_id|>",
            m.content
        ));
    }
    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    prompt
}

pub fn translate(req: &NormalisedRequest) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("prompt".to_string(), json!(to_instruct_prompt(req)));
    if let Some(t) = req.max_tokens {
        body.insert("max_gen_len".to_string(), json!(t));
    }
    if let Some(t) = req.temperature {
        body.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        body.insert("top_p".to_string(), json!(p));
    }
    Value::Object(body)
}

pub fn parse_response(json: &Value, model_id: &str) -> AdapterResult<ChatResponse> {
    let content = json["generation"].as_str().ok_or(ErrorKind::Transient)?.to_string();

    Ok(ChatResponse {
        id: String::new(),
        object: "chat.completion",
        created: 0,
        model: model_id.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage { role: Role::Assistant, content, name: None, tool_call_id: None },
            finish_reason: json["stop_reason"].as_str().map(str::to_string),
        }],
        usage: TokenUsage {
            prompt_tokens: json["prompt_token_count"].as_u64().unwrap_or_default() as u32,
            completion_tokens: json["generation_token_count"].as_u64().unwrap_or_default() as u32,
            total_tokens: (json["prompt_token_count"].as_u64().unwrap_or_default()
                + json["generation_token_count"].as_u64().unwrap_or_default()) as u32,
        },
    })
}

/// Each streaming event carries `{generation, prompt_token_count,
/// generation_token_count, stop_reason}`; `stop_reason` is `null` until the
/// final chunk.
pub fn parse_stream_chunk(payload: &Value, model_id: &str) -> Option<ChatChunk> {
    let content = payload["generation"].as_str().filter(|s| !s.is_empty()).map(str::to_string);
    let finish_reason = payload["stop_reason"].as_str().map(str::to_string);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;

    #[test]
    fn instruct_template_wraps_each_message() {
        let req = NormalisedRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hello".to_string(),
                name: None,
                tool_call_id: None,
            }],
            ..Default::default()
        };
        let prompt = to_instruct_prompt(&req);
        assert!(prompt.contains("<|start_header_id|>user<|end_header_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }
}
