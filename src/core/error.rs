//! Request-path error taxonomy and its stable HTTP mapping.
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use crate::ports::store::StoreError;

/// Every way a gateway request (or an admin call) can fail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Request body exceeds the {limit_bytes} byte limit")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Circuit breaker open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("No healthy instance available for service '{service}'")]
    NoHealthyInstance { service: String },

    #[error("Upstream '{service}' timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("Upstream '{service}' failed: {message}")]
    UpstreamError {
        service: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } | GatewayError::NoHealthyInstance { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code placed in the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::NoHealthyInstance { .. } => "NO_HEALTHY_INSTANCE",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamError { .. } => "UPSTREAM_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Only failures of the upstream call itself are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout { .. } | GatewayError::UpstreamError { .. }
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Short label used for the `kind` metric dimension
    pub fn metric_kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::NoHealthyInstance { .. } => "no_healthy_instance",
            GatewayError::UpstreamTimeout { .. } => "timeout",
            GatewayError::UpstreamError { .. } => "upstream",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// JSON error envelope: `{"error":{"code","message","retryAfter"?},"requestId"}`
    pub fn envelope(&self, request_id: Option<&str>) -> Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(retry_after) = self.retry_after_secs() {
            error["retryAfter"] = json!(retry_after);
        }
        json!({
            "error": error,
            "requestId": request_id,
        })
    }

    /// Build the full HTTP response for this error.
    pub fn to_response(&self, request_id: Option<&str>) -> Response {
        let mut response = (self.status_code(), Json(self.envelope(request_id))).into_response();
        if let Some(retry_after) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if let Some(id) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
            response.headers_mut().insert("x-request-id", id);
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_variant_to_its_status() {
        let cases = [
            (GatewayError::Validation("x".into()), 400),
            (GatewayError::NotFound("x".into()), 404),
            (GatewayError::Unauthorized("x".into()), 401),
            (GatewayError::Forbidden("x".into()), 403),
            (GatewayError::PayloadTooLarge { limit_bytes: 8 }, 413),
            (GatewayError::RateLimited { retry_after_secs: 3 }, 429),
            (
                GatewayError::CircuitOpen {
                    service: "s".into(),
                },
                503,
            ),
            (
                GatewayError::NoHealthyInstance {
                    service: "s".into(),
                },
                503,
            ),
            (
                GatewayError::UpstreamTimeout {
                    service: "s".into(),
                    timeout_ms: 10,
                },
                504,
            ),
            (
                GatewayError::UpstreamError {
                    service: "s".into(),
                    message: "boom".into(),
                    status: Some(500),
                },
                502,
            ),
            (GatewayError::Internal("x".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{err:?}");
        }
    }

    #[test]
    fn rate_limited_envelope_carries_retry_after() {
        let err = GatewayError::RateLimited { retry_after_secs: 42 };
        let body = err.envelope(Some("req-1"));
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["retryAfter"], 42);
        assert_eq!(body["requestId"], "req-1");

        let response = err.to_response(Some("req-1"));
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(response.headers()["x-request-id"], "req-1");
    }

    #[test]
    fn only_upstream_failures_are_retryable() {
        assert!(
            GatewayError::UpstreamTimeout {
                service: "s".into(),
                timeout_ms: 1
            }
            .is_retryable()
        );
        assert!(!GatewayError::CircuitOpen { service: "s".into() }.is_retryable());
        assert!(!GatewayError::NotFound("x".into()).is_retryable());
        assert!(
            GatewayError::NotFound("x".into())
                .envelope(None)
                .get("error")
                .and_then(|e| e.get("retryAfter"))
                .is_none()
        );
    }
}
