//! Canonical request/response types shared by the Router, Parameter
//! Translator, and every Provider Adapter (§3 `NormalisedRequest`, `Outcome`).
//!
//! Grounded in the teacher's `llm/mod.rs` (`ChatMessage`, `ChatOptions`,
//! `ChatResponse`, `TokenUsage`), trimmed to the fields the spec names and
//! with tool/vision support flattened into the canonical translator fields
//! rather than the teacher's richer `ContentPart`/`ReasoningContent` union.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// The canonical chat request the Router receives from the front door and
/// passes to `PoolManager`/`ProviderAdapter`. Immutable once dispatched.
#[derive(Debug, Clone, Default)]
pub struct NormalisedRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub stream: bool,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
    pub response_format: Option<Value>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub user: Option<String>,
    pub seed: Option<i64>,
    pub n: Option<u32>,
    pub min_p: Option<f64>,
    pub repetition_penalty: Option<f64>,
    pub length_penalty: Option<f64>,
    pub ignore_eos: Option<bool>,
    pub best_of: Option<u32>,
    pub echo: Option<bool>,
    pub logprobs: Option<bool>,
    pub logit_bias: Option<HashMap<String, f64>>,
    pub include_stop_str_in_output: Option<bool>,
    pub enable_thinking: Option<bool>,
    pub provider_overrides: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeltaChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<DeltaChoice>,
}
