//! Parameter Translator (§4.9): canonical request fields → provider-specific
//! wire shapes.
//!
//! The canonical names are already snake_case, so the OpenAI-compatible and
//! vLLM families pass almost everything straight through (the "fast path"
//! §4.9 calls out for snake_case-native providers); Anthropic and Bedrock
//! reshape the request into their own JSON bodies. This module owns the
//! mapping table; the family-specific Bedrock bodies live in `adapters::bedrock`.

use serde_json::{json, Map, Value};

use crate::adapters::ProviderKind;
use crate::model::NormalisedRequest;

/// Canonical snake_case fields this translator guarantees to recognise
/// (§4.9). Fields absent from `NormalisedRequest` are never serialised —
/// `None` never becomes `null`.
fn canonical_fields(req: &NormalisedRequest) -> Map<String, Value> {
    let mut fields = Map::new();
    macro_rules! put {
        ($key:literal, $value:expr) => {
            if let Some(v) = $value {
                fields.insert($key.to_string(), json!(v));
            }
        };
    }

    fields.insert(
        "messages".to_string(),
        json!(req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": format!("{:?}", m.role).to_lowercase(),
                    "content": m.content,
                })
            })
            .collect::<Vec<_>>()),
    );

    put!("max_tokens", req.max_tokens);
    put!("temperature", req.temperature);
    put!("top_p", req.top_p);
    put!("top_k", req.top_k);
    put!("stop", req.stop.clone());
    put!("tools", req.tools.clone());
    put!("tool_choice", req.tool_choice.clone());
    put!("response_format", req.response_format.clone());
    put!("frequency_penalty", req.frequency_penalty);
    put!("presence_penalty", req.presence_penalty);
    put!("user", req.user.clone());
    put!("seed", req.seed);
    put!("n", req.n);
    put!("min_p", req.min_p);
    put!("repetition_penalty", req.repetition_penalty);
    put!("length_penalty", req.length_penalty);
    put!("ignore_eos", req.ignore_eos);
    put!("best_of", req.best_of);
    put!("echo", req.echo);
    put!("logprobs", req.logprobs);
    put!("logit_bias", req.logit_bias.clone());
    put!("include_stop_str_in_output", req.include_stop_str_in_output);

    fields.insert("stream".to_string(), json!(req.stream));

    fields
}

fn merge_overrides(mut body: Value, overrides: &Option<Value>) -> Value {
    if let Some(Value::Object(over)) = overrides {
        if let Value::Object(ref mut map) = body {
            for (k, v) in over {
                map.insert(k.clone(), v.clone());
            }
        }
    }
    body
}

/// Whether `kind` requires full translation (anything beyond the snake_case
/// fast path) for the given request. A request with no translation-requiring
/// fields against a snake_case-native provider skips the reshape step
/// entirely (§4.9 "high-throughput mode").
pub fn needs_translation(kind: ProviderKind, req: &NormalisedRequest) -> bool {
    if kind.is_bedrock() || kind == ProviderKind::Anthropic {
        return true;
    }
    kind.is_vllm_family() && req.enable_thinking.is_some()
}

/// Builds the outbound JSON body for `kind`. OpenAI-compatible and
/// non-thinking vLLM-family requests take the fast path (canonical fields,
/// shallow-merged overrides, nothing else). vLLM-family requests carrying
/// `enable_thinking` route it (and any `chat_template_kwargs` override)
/// under a single `chat_template_kwargs` object. Anthropic and Bedrock are
/// reshaped by their own functions.
pub fn translate(kind: ProviderKind, req: &NormalisedRequest) -> Value {
    match kind {
        ProviderKind::OpenAiCompatible => {
            let body = Value::Object(canonical_fields(req));
            merge_overrides(body, &req.provider_overrides)
        }
        k if k.is_vllm_family() => translate_vllm(req),
        ProviderKind::Anthropic => translate_anthropic(req),
        k if k.is_bedrock() => crate::adapters::bedrock::translate_bedrock(k, req),
        _ => {
            let body = Value::Object(canonical_fields(req));
            merge_overrides(body, &req.provider_overrides)
        }
    }
}

fn translate_vllm(req: &NormalisedRequest) -> Value {
    let mut fields = canonical_fields(req);

    if req.enable_thinking.is_some() || has_chat_template_kwargs(&req.provider_overrides) {
        let mut kwargs = Map::new();
        if let Some(enable_thinking) = req.enable_thinking {
            kwargs.insert("enable_thinking".to_string(), json!(enable_thinking));
        }
        if let Some(Value::Object(overrides)) = &req.provider_overrides {
            if let Some(Value::Object(existing)) = overrides.get("chat_template_kwargs") {
                for (k, v) in existing {
                    kwargs.insert(k.clone(), v.clone());
                }
            }
        }
        fields.insert("chat_template_kwargs".to_string(), Value::Object(kwargs));
    }

    let body = Value::Object(fields);
    let overrides_without_kwargs = req.provider_overrides.as_ref().map(|v| {
        let mut v = v.clone();
        if let Value::Object(map) = &mut v {
            map.remove("chat_template_kwargs");
        }
        v
    });
    merge_overrides(body, &overrides_without_kwargs)
}

fn has_chat_template_kwargs(overrides: &Option<Value>) -> bool {
    matches!(overrides, Some(Value::Object(m)) if m.contains_key("chat_template_kwargs"))
}

/// Splits the leading system message out, renames `max_tokens` (already
/// canonical, kept as-is), and wraps the remaining messages (§4.2).
fn translate_anthropic(req: &NormalisedRequest) -> Value {
    use crate::model::Role;

    let mut system = None;
    let mut messages = Vec::new();
    for m in &req.messages {
        if matches!(m.role, Role::System) && system.is_none() {
            system = Some(m.content.clone());
        } else {
            messages.push(json!({
                "role": format!("{:?}", m.role).to_lowercase(),
                "content": m.content,
            }));
        }
    }

    let mut body = Map::new();
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
    if let Some(k) = req.top_k {
        body.insert("top_k".to_string(), json!(k));
    }
    if let Some(stop) = &req.stop {
        body.insert("stop_sequences".to_string(), json!(stop));
    }
    if let Some(tools) = &req.tools {
        body.insert("tools".to_string(), tools.clone());
    }
    body.insert("stream".to_string(), json!(req.stream));

    merge_overrides(Value::Object(body), &req.provider_overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, Role};

    fn sample_request() -> NormalisedRequest {
        NormalisedRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
                name: None,
                tool_call_id: None,
            }],
            max_tokens: Some(100),
            temperature: Some(0.7),
            ..Default::default()
        }
    }

    #[test]
    fn undefined_fields_are_omitted_not_null() {
        let req = sample_request();
        let body = translate(ProviderKind::OpenAiCompatible, &req);
        assert!(body.get("top_k").is_none());
        assert!(!body.as_object().unwrap().values().any(|v| v.is_null()));
    }

    #[test]
    fn provider_overrides_merge_last() {
        let mut req = sample_request();
        req.provider_overrides = Some(json!({"temperature": 0.1, "custom_field": "x"}));
        let body = translate(ProviderKind::OpenAiCompatible, &req);
        assert_eq!(body["temperature"], json!(0.1));
        assert_eq!(body["custom_field"], json!("x"));
    }

    #[test]
    fn vllm_family_routes_enable_thinking_under_chat_template_kwargs() {
        let mut req = sample_request();
        req.enable_thinking = Some(true);
        let body = translate(ProviderKind::Together, &req);
        assert_eq!(body["chat_template_kwargs"]["enable_thinking"], json!(true));
        assert!(body.get("enable_thinking").is_none());
    }

    #[test]
    fn anthropic_splits_system_message() {
        let mut req = sample_request();
        req.messages.insert(
            0,
            ChatMessage {
                role: Role::System,
                content: "be nice".to_string(),
                name: None,
                tool_call_id: None,
            },
        );
        let body = translate_anthropic(&req);
        assert_eq!(body["system"], json!("be nice"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn needs_translation_identifies_fast_path_eligibility() {
        let req = sample_request();
        assert!(!needs_translation(ProviderKind::OpenAiCompatible, &req));
        assert!(needs_translation(ProviderKind::Anthropic, &req));
        assert!(needs_translation(ProviderKind::BedrockAnthropic, &req));
    }
}
