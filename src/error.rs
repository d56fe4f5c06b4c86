//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the lifecycle manager, catalog and reconciler.
///
/// Per-request proxy failures do not use this type; they are answered
/// inline with [`json_error_response`] and never escape the request cycle.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or unvalidated configuration; the last-known-good config
    /// stays active.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Start requested on a port already held by another environment.
    #[error("port {port} is already in use by environment '{holder}'")]
    PortInUse { port: u16, holder: String },

    /// The OS refused the bind (typically a foreign process owns the port).
    #[error("failed to bind port {port}: {source}")]
    BindFailure {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Stop requested on an environment with no live listener.
    #[error("environment '{0}' is not running")]
    NotRunning(String),

    /// Catalog uniqueness violation (duplicate environment or dev server).
    #[error("duplicate entry: {0}")]
    DuplicateReference(String),

    /// Environment lookup failed.
    #[error("environment '{0}' not found")]
    EnvNotFound(String),

    /// Dev server lookup failed.
    #[error("dev server '{0}' not found")]
    DevServerNotFound(String),

    /// Dev server deletion rejected while environments still reference it.
    #[error("dev server '{0}' is still referenced by an environment")]
    DevServerInUse(String),
}

/// Error codes attached to failed proxy responses
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// The tagged request names an environment with no live listener
    UnknownEnvironment,
    /// The environment has no dev server to forward to
    NoDevServer,
    /// Failed to reach the dev server or API origin
    UpstreamUnreachable,
    /// Upstream did not answer within the request timeout
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownEnvironment => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::NoDevServer => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownEnvironment => "UNKNOWN_ENVIRONMENT",
            ProxyErrorCode::NoDevServer => "NO_DEV_SERVER",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UnknownEnvironment.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            ProxyErrorCode::UnknownEnvironment,
            "no environment is running on port 3000",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_ENVIRONMENT\""));
        assert!(json.contains("\"message\":\"no environment is running on port 3000\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response =
            json_error_response(ProxyErrorCode::RequestTimeout, "upstream did not answer");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::PortInUse {
            port: 3000,
            holder: "feature-a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "port 3000 is already in use by environment 'feature-a'"
        );

        let err = GatewayError::NotRunning("feature-a+3000".to_string());
        assert_eq!(err.to_string(), "environment 'feature-a+3000' is not running");
    }
}
