//! Client-facing error taxonomy
//!
//! Every failure a caller can see maps to one variant here and renders as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Permission(String),

    #[error("no upstream account available")]
    NoAccountAvailable,

    /// Upstream answered non-2xx, or could not be reached (`status` 502)
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Permission(_) => StatusCode::FORBIDDEN,
            GatewayError::NoAccountAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request",
            GatewayError::Unauthenticated(_) => "authentication_error",
            GatewayError::Permission(_) => "insufficient_permissions",
            GatewayError::NoAccountAvailable => "service_unavailable",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Render with the request id. Credential-shaped text in the message,
    /// including upstream bodies, is redacted.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let message = common::redact(&self.to_string()).into_owned();
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": message,
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
