//! Error types for the Creditgate service.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for Creditgate operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The request exceeded its tier's fixed-window limit.
    #[error("Rate limit exceeded, retry after {}s", retry_after_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    /// The token's cached balance cannot cover the request.
    #[error("Insufficient credits")]
    InsufficientCredits,

    /// The source of truth, billing backend or proxied upstream is unreachable.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Unexpected failure in admission or ledger logic.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Stable machine-readable code used in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::InsufficientCredits => "insufficient_credits",
            GatewayError::UpstreamUnavailable(_) | GatewayError::Http(_) => "upstream_unavailable",
            GatewayError::Internal(_) | GatewayError::Config(_) | GatewayError::Io(_) => "internal",
        }
    }

    /// HTTP status for this error when it reaches a caller.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            GatewayError::UpstreamUnavailable(_) | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) | GatewayError::Config(_) | GatewayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Human-readable message for the envelope.
    ///
    /// Internal details are kept out of responses and only logged.
    fn public_message(&self) -> String {
        match self {
            GatewayError::RateLimited { .. } | GatewayError::InsufficientCredits => self.to_string(),
            GatewayError::UpstreamUnavailable(_) | GatewayError::Http(_) => {
                "Upstream service unavailable".to_string()
            }
            _ => "Internal server error".to_string(),
        }
    }
}

/// Whole seconds until a retry may succeed, rounded up.
pub fn retry_after_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        });

        let retry_after = match &self {
            GatewayError::RateLimited { retry_after } => {
                let secs = retry_after_secs(retry_after);
                body["error"]["retry_after"] = json!(secs);
                Some(secs)
            }
            _ => None,
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result type alias for Creditgate operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
