//! Error taxonomy for the dispatch engine.
//!
//! Kinds, not type names: each variant corresponds to one of the outcome
//! classifications in the spec (timeout, cancelled, circuit-open, transient,
//! rate-limited, immediate-failure, credential-error, model-unknown,
//! all-endpoints-exhausted). Adapters classify; the Router reconciles;
//! nothing here retries on its own.

use thiserror::Error;

/// A stable, user-visible error kind. Mirrors the outcome classification
/// carried on `Outcome` so the same taxonomy flows end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Cancelled,
    CircuitOpen,
    Transient,
    RateLimited,
    ImmediateFailure,
    CredentialError,
    ModelUnknown,
    AllEndpointsExhausted,
}

impl ErrorKind {
    /// Whether this classification should be retried against a *different*
    /// endpoint within the same pool (transient family).
    pub fn is_retryable_elsewhere(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::CredentialError
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Timeout => 408,
            ErrorKind::Cancelled => 499,
            ErrorKind::CircuitOpen => 503,
            ErrorKind::Transient | ErrorKind::RateLimited => 502,
            ErrorKind::ImmediateFailure | ErrorKind::CredentialError => 502,
            ErrorKind::ModelUnknown => 400,
            ErrorKind::AllEndpointsExhausted => 503,
        }
    }
}

/// Top-level gateway error. Carries enough context to build the stable
/// `{error:{message, type, code, details}}` response body from §7.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("deadline exceeded after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    Timeout {
        elapsed_ms: u64,
        timeout_ms: u64,
        request_id: String,
    },

    #[error("request cancelled: {reason}")]
    Cancelled { reason: String, request_id: String },

    #[error("circuit open for endpoint {endpoint_id}")]
    CircuitOpen {
        endpoint_id: String,
        request_id: String,
    },

    #[error("transient upstream error on {endpoint_id}: {message}")]
    Transient {
        endpoint_id: String,
        message: String,
        request_id: String,
    },

    #[error("rate limited on {endpoint_id}: {message}")]
    RateLimited {
        endpoint_id: String,
        message: String,
        request_id: String,
    },

    #[error("immediate failure on {endpoint_id}: {message}")]
    ImmediateFailure {
        endpoint_id: String,
        message: String,
        request_id: String,
    },

    #[error("credential error for {endpoint_id}: {message}")]
    CredentialError {
        endpoint_id: String,
        message: String,
        request_id: String,
    },

    #[error("model '{model}' is not configured")]
    ModelUnknown { model: String, request_id: String },

    #[error("all endpoints exhausted for model '{model}': {last_error}")]
    AllEndpointsExhausted {
        model: String,
        last_error: String,
        request_id: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Cancelled { .. } => ErrorKind::Cancelled,
            GatewayError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GatewayError::Transient { .. } => ErrorKind::Transient,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::ImmediateFailure { .. } => ErrorKind::ImmediateFailure,
            GatewayError::CredentialError { .. } => ErrorKind::CredentialError,
            GatewayError::ModelUnknown { .. } => ErrorKind::ModelUnknown,
            GatewayError::AllEndpointsExhausted { .. } => ErrorKind::AllEndpointsExhausted,
            GatewayError::Configuration(_) => ErrorKind::ModelUnknown,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            GatewayError::Timeout { request_id, .. }
            | GatewayError::Cancelled { request_id, .. }
            | GatewayError::CircuitOpen { request_id, .. }
            | GatewayError::Transient { request_id, .. }
            | GatewayError::RateLimited { request_id, .. }
            | GatewayError::ImmediateFailure { request_id, .. }
            | GatewayError::CredentialError { request_id, .. }
            | GatewayError::ModelUnknown { request_id, .. }
            | GatewayError::AllEndpointsExhausted { request_id, .. } => Some(request_id),
            GatewayError::Configuration(_) => None,
        }
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        match self {
            GatewayError::CircuitOpen { endpoint_id, .. }
            | GatewayError::Transient { endpoint_id, .. }
            | GatewayError::RateLimited { endpoint_id, .. }
            | GatewayError::ImmediateFailure { endpoint_id, .. }
            | GatewayError::CredentialError { endpoint_id, .. } => Some(endpoint_id),
            _ => None,
        }
    }
}

/// Credential resolution errors (§4.1). `not_found` and `validation_failed`
/// are non-retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential reference '{0}' is not registered")]
    NotFound(String),
    #[error("credential store failed to fetch secret for '{0}': {1}")]
    StoreFailed(String, String),
    #[error("credential resolution timed out for '{0}'")]
    Timeout(String),
    #[error("credential store configuration invalid for '{0}': {1}")]
    ValidationFailed(String, String),
}

impl CredentialError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CredentialError::NotFound(_) | CredentialError::ValidationFailed(_, _)
        )
    }
}
