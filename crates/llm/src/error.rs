//! Error taxonomy and the driver-error classification table.
//!
//! Translation failures are plain 400s. Driver failures are classified by a
//! pure function into an Anthropic error kind plus a suggested HTTP status,
//! chosen to steer the client's built-in retry loop: retryable conditions
//! become `rate_limit_error`/`overloaded_error`, size problems become
//! `request_too_large` so the client shrinks the prompt instead of retrying.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use thiserror::Error;

use crate::messages::anthropic::{ErrorDetail, ErrorResponse};

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Adapter errors with their user-visible kind and HTTP status.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The inbound Anthropic prompt violates structural rules.
    #[error("{0}")]
    ProtocolInvariant(String),

    /// A file part carries a media type no driver accepts.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// The model prefix names a provider that is not registered.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Schema adaptation failed; impossible for well-formed input.
    #[error("schema adaptation failed: {0}")]
    SchemaAdapt(String),

    /// The provider HTTP call failed before any response bytes were written.
    #[error("upstream call to '{}' failed: {}", .0.provider, .0.message)]
    DriverUpstream(Box<DriverError>),

    /// The provider stream failed after the response began.
    #[error("stream from '{}' failed: {}", .0.provider, .0.message)]
    DriverStream(Box<DriverError>),

    /// The caller went away; cancels upstream, produces no response.
    #[error("client disconnected")]
    ClientAbort,

    /// Anything the handler did not anticipate.
    #[error("{0}")]
    Internal(String),
}

impl LlmError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProtocolInvariant(_)
            | Self::UnsupportedMediaType(_)
            | Self::UnknownProvider(_)
            | Self::SchemaAdapt(_) => StatusCode::BAD_REQUEST,
            Self::DriverUpstream(error) | Self::DriverStream(error) => classify(error).0,
            Self::ClientAbort => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `error.type` string written into the response body.
    pub fn error_type(&self) -> &str {
        match self {
            Self::ProtocolInvariant(_) => "protocol_invariant",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::SchemaAdapt(_) => "schema_adapt",
            Self::DriverUpstream(_) => "driver_upstream",
            Self::DriverStream(_) => "driver_stream",
            Self::ClientAbort => "client_abort",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        match &self {
            // Driver failures go through the classification table so the
            // status and kind stay consistent with mid-stream mapping.
            Self::DriverUpstream(error) | Self::DriverStream(error) => {
                let (status, detail) = classify(error);
                (status, Json(wrap(detail))).into_response()
            }
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": format!("Internal server error: {message}")
                })),
            )
                .into_response(),
            _ => {
                let body = ErrorResponse::new(self.error_type(), self.to_string());
                (self.status_code(), Json(body)).into_response()
            }
        }
    }
}

/// A failure reported by a backend driver, before or during streaming.
#[derive(Debug, Clone)]
pub struct DriverError {
    /// Driver kind string: `openai`, `google`, `xai`, `azure`, `anthropic`.
    pub provider: String,
    /// Provider error code, e.g. OpenAI's `rate_limit_exceeded`.
    pub code: Option<String>,
    /// Provider error type/category, e.g. OpenAI's `tokens`.
    pub error_type: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Upstream HTTP status, when the failure was an HTTP response.
    pub status: Option<u16>,
    /// True for connection-level failures with no provider payload.
    pub transport: bool,
    /// The raw provider error payload, when one was parsed.
    pub raw: Option<Value>,
}

impl DriverError {
    /// A connection-level failure with no provider payload.
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            code: None,
            error_type: None,
            message: message.into(),
            status: None,
            transport: true,
            raw: None,
        }
    }

    /// Wrap as a pre-stream upstream failure.
    pub fn upstream(self) -> LlmError {
        LlmError::DriverUpstream(Box::new(self))
    }

    /// Wrap as a mid-stream failure.
    pub fn mid_stream(self) -> LlmError {
        LlmError::DriverStream(Box::new(self))
    }
}

/// Classify a driver error into an HTTP status and an Anthropic error body.
///
/// Pure and deterministic: the same error value always maps to the same
/// kind and status. The proxy performs the write; mid-stream the status is
/// discarded and only the body is emitted as an inline `error` event.
pub fn classify(error: &DriverError) -> (StatusCode, ErrorDetail) {
    if error.provider == "openai" {
        match error.code.as_deref() {
            // OpenAI 5xx is usually transient; report it as backpressure so
            // the client retries.
            Some("server_error") => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorDetail {
                        error_type: "rate_limit_error".to_string(),
                        message: error.message.clone(),
                    },
                );
            }
            Some("rate_limit_exceeded") => {
                // A token-sized rate limit means the prompt itself is too
                // large; retrying verbatim can never succeed.
                if error.error_type.as_deref() == Some("tokens") {
                    return (
                        StatusCode::PAYLOAD_TOO_LARGE,
                        ErrorDetail {
                            error_type: "request_too_large".to_string(),
                            message: error.message.clone(),
                        },
                    );
                }

                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorDetail {
                        error_type: "rate_limit_error".to_string(),
                        message: error.message.clone(),
                    },
                );
            }
            _ => {}
        }
    }

    if error.transport {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetail {
                error_type: "overloaded_error".to_string(),
                message: error.message.clone(),
            },
        );
    }

    // Anything else passes through as a caller-visible failure with the
    // provider's own category when it reported one.
    (
        StatusCode::BAD_REQUEST,
        ErrorDetail {
            error_type: error
                .error_type
                .clone()
                .or_else(|| error.code.clone())
                .unwrap_or_else(|| "api_error".to_string()),
            message: error.message.clone(),
        },
    )
}

fn wrap(detail: ErrorDetail) -> ErrorResponse {
    ErrorResponse {
        response_type: "error".to_string(),
        error: detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_error(code: &str, error_type: Option<&str>) -> DriverError {
        DriverError {
            provider: "openai".to_string(),
            code: Some(code.to_string()),
            error_type: error_type.map(str::to_string),
            message: "upstream failed".to_string(),
            status: Some(429),
            transport: false,
            raw: None,
        }
    }

    #[test]
    fn openai_server_error_becomes_retryable() {
        let (status, detail) = classify(&openai_error("server_error", None));

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(detail.error_type, "rate_limit_error");
    }

    #[test]
    fn openai_token_rate_limit_becomes_request_too_large() {
        let (status, detail) = classify(&openai_error("rate_limit_exceeded", Some("tokens")));

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(detail.error_type, "request_too_large");
    }

    #[test]
    fn openai_request_rate_limit_stays_retryable() {
        let (status, detail) = classify(&openai_error("rate_limit_exceeded", Some("requests")));

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(detail.error_type, "rate_limit_error");
    }

    #[test]
    fn transport_failure_becomes_overloaded() {
        let (status, detail) = classify(&DriverError::transport("google", "connection reset"));

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(detail.error_type, "overloaded_error");
    }

    #[test]
    fn other_provider_errors_pass_through() {
        let error = DriverError {
            provider: "google".to_string(),
            code: Some("INVALID_ARGUMENT".to_string()),
            error_type: None,
            message: "bad schema".to_string(),
            status: Some(400),
            transport: false,
            raw: None,
        };

        let (status, detail) = classify(&error);

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(detail.error_type, "INVALID_ARGUMENT");
        assert_eq!(detail.message, "bad schema");
    }

    #[test]
    fn classification_is_deterministic() {
        let error = openai_error("server_error", None);

        let first = classify(&error);
        let second = classify(&error);

        assert_eq!(first.0, second.0);
        assert_eq!(first.1.error_type, second.1.error_type);
        assert_eq!(first.1.message, second.1.message);
    }
}
