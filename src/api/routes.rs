//! Route definitions and `AppState` for the thin front door.
//!
//! The `/v1/chat/completions` handler here exists only to exercise the
//! contract: it parses just enough of the OpenAI request shape to build a
//! `NormalisedRequest`, stamps a `RequestContext` from `X-Request-Timeout-Ms`
//! (clamped per §6.1), and hands off to the Router. Full request validation,
//! auth, and rate limiting at the edge are the out-of-scope front door's job.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::{ContextRegistry, RequestContext};
use crate::error::GatewayError;
use crate::events::EventLog;
use crate::model::NormalisedRequest;
use crate::router::{Router, RouterResponse};

const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AppState {
    pub router: Router,
    pub events: Arc<EventLog>,
    pub contexts: ContextRegistry,
}

pub fn serve(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .route("/admin/endpoints", get(list_endpoints))
        .route("/admin/pools/:id/health", get(pool_health))
        .route("/admin/events", get(recent_events))
        .with_state(state)
}

fn request_timeout(headers: &HeaderMap) -> Duration {
    headers
        .get("X-Request-Timeout-Ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CHAT_TIMEOUT)
        .clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[derive(serde::Deserialize)]
struct ChatCompletionsRequest {
    model: String,
    #[serde(flatten)]
    body: serde_json::Value,
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatCompletionsRequest>,
) -> impl IntoResponse {
    let timeout = request_timeout(&headers);
    let ctx = RequestContext::new(request_id(&headers), timeout);
    ctx.arm_deadline_timer();
    state.contexts.track(&ctx).await;

    let req = match parse_normalised_request(&payload.body) {
        Ok(r) => r,
        Err(message) => {
            state.contexts.untrack(&ctx).await;
            return error_response(
                StatusCode::BAD_REQUEST,
                &message,
                "invalid_request_error",
                "invalid_request",
                &ctx.id,
                None,
                json!({}),
            );
        }
    };

    let request_id = ctx.id.clone();
    let result = state.router.execute(&payload.model, &req, &ctx).await;
    state.contexts.untrack(&ctx).await;

    match result {
        Ok(outcome) => match outcome.response {
            RouterResponse::Complete(response) => {
                (StatusCode::OK, [("X-Request-Id", request_id)], Json(json!(response))).into_response()
            }
            RouterResponse::Stream(_) => {
                // Streaming response bodies are constructed by the front
                // door from the returned chunk stream; this demonstration
                // surface reports that a stream was opened rather than
                // re-implementing SSE framing at the edge.
                (
                    StatusCode::OK,
                    [("X-Request-Id", request_id)],
                    Json(json!({"streaming": true, "endpoint_id": outcome.endpoint_id})),
                )
                    .into_response()
            }
        },
        Err(err) => gateway_error_response(&err),
    }
}

fn parse_normalised_request(body: &serde_json::Value) -> Result<NormalisedRequest, String> {
    let messages = body["messages"]
        .as_array()
        .ok_or("'messages' must be an array")?
        .iter()
        .map(|m| {
            let role = match m["role"].as_str().unwrap_or("user") {
                "system" => crate::model::Role::System,
                "assistant" => crate::model::Role::Assistant,
                "tool" => crate::model::Role::Tool,
                _ => crate::model::Role::User,
            };
            crate::model::ChatMessage {
                role,
                content: m["content"].as_str().unwrap_or_default().to_string(),
                name: m["name"].as_str().map(str::to_string),
                tool_call_id: m["tool_call_id"].as_str().map(str::to_string),
            }
        })
        .collect();

    Ok(NormalisedRequest {
        messages,
        max_tokens: body["max_tokens"].as_u64().map(|v| v as u32),
        temperature: body["temperature"].as_f64(),
        top_p: body["top_p"].as_f64(),
        stream: body["stream"].as_bool().unwrap_or(false),
        provider_overrides: body.get("provider_overrides").cloned(),
        ..Default::default()
    })
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct EndpointSummary {
    id: String,
    state: String,
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut summaries = Vec::new();
    for id in state.router.endpoint_ids() {
        let circuit_state = state.router.endpoint_state(&id).await;
        summaries.push(EndpointSummary { id, state: format!("{circuit_state:?}") });
    }
    Json(summaries)
}

async fn pool_health(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.router.pool_health(&id).await {
        Some(health) => Json(json!({
            "status": format!("{:?}", health.status),
            "score": health.score,
            "healthyCount": health.healthy_count,
            "totalCount": health.total_count,
            "avgResponseTimeMs": health.avg_response_time.as_millis() as u64,
            "errorRate": health.error_rate,
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn recent_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let events = state.events.recent(50).await;
    Json(events)
}

fn gateway_error_response(err: &GatewayError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // §6.1: the 408 timeout body carries `timeoutMs`/`elapsedMs` alongside
    // `requestId` in `details`.
    let extra_details = match err {
        GatewayError::Timeout { elapsed_ms, timeout_ms, .. } => {
            json!({ "timeoutMs": timeout_ms, "elapsedMs": elapsed_ms })
        }
        _ => json!({}),
    };
    error_response(
        status,
        &err.to_string(),
        error_type(err),
        error_code(err),
        err.request_id().unwrap_or_default(),
        err.endpoint_id(),
        extra_details,
    )
}

fn error_type(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Timeout { .. } => "timeout_error",
        GatewayError::Cancelled { .. } => "cancelled_error",
        GatewayError::ModelUnknown { .. } => "invalid_request_error",
        _ => "api_error",
    }
}

fn error_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Timeout { .. } => "request_timeout",
        GatewayError::Cancelled { .. } => "request_cancelled",
        GatewayError::CircuitOpen { .. } => "circuit_open",
        GatewayError::Transient { .. } => "transient_error",
        GatewayError::RateLimited { .. } => "rate_limited",
        GatewayError::ImmediateFailure { .. } => "immediate_failure",
        GatewayError::CredentialError { .. } => "credential_error",
        GatewayError::ModelUnknown { .. } => "model_unknown",
        GatewayError::AllEndpointsExhausted { .. } => "all_endpoints_exhausted",
        GatewayError::Configuration(_) => "configuration_error",
    }
}

fn error_response(
    status: StatusCode,
    message: &str,
    error_type: &'static str,
    code: &'static str,
    request_id: &str,
    endpoint_id: Option<&str>,
    extra_details: serde_json::Value,
) -> axum::response::Response {
    let mut details = json!({
        "requestId": request_id,
        "endpointId": endpoint_id,
    });
    if let (Value::Object(details), Value::Object(extra)) = (&mut details, &extra_details) {
        for (k, v) in extra {
            details.insert(k.clone(), v.clone());
        }
    }
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": code,
                "details": details,
            }
        })),
    )
        .into_response()
}
