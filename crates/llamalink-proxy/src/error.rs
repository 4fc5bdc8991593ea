//! Proxy error taxonomy and HTTP mapping.
//!
//! Every failure path in a handler is recovered into a structured response —
//! a malformed body or an unreachable upstream must never take the server
//! down. Mid-stream failures cannot use a status code (headers are already
//! sent) and are emitted as SSE error events instead; see
//! `ollama_stream`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::ErrorResponse;

/// Errors produced by translation, routing and the upstream client.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The client body failed to parse as the expected OpenAI shape.
    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    /// The request named no model. Whether the model actually exists is
    /// left to the upstream call.
    #[error("Request is missing a model name")]
    MissingModel,

    /// The Ollama server could not be reached.
    #[error("Failed to connect to Ollama: {0}")]
    UpstreamUnavailable(String),

    /// The upstream call (or a single streamed chunk) exceeded the
    /// configured timeout.
    #[error("Ollama request timed out")]
    UpstreamTimeout,

    /// Ollama answered with a non-success status.
    #[error("Ollama returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// The upstream connection closed before a `done` chunk arrived.
    #[error("Ollama stream ended before completion")]
    StreamTruncated,
}

impl ProxyError {
    /// HTTP status this error maps to when it occurs before headers are sent.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::MissingModel => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable(_) | Self::UpstreamStatus { .. } | Self::StreamTruncated => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// OpenAI-style `error.type` discriminator.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::MissingModel => "invalid_request_error",
            Self::UpstreamTimeout => "timeout_error",
            Self::UpstreamUnavailable(_) | Self::UpstreamStatus { .. } | Self::StreamTruncated => {
                "upstream_error"
            }
        }
    }

    /// The OpenAI error envelope for this error.
    #[must_use]
    pub fn envelope(&self) -> ErrorResponse {
        ErrorResponse::new(self.to_string(), self.error_type())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.envelope())).into_response()
    }
}
