//! Error types for the gateway
//!
//! Every failure the registry, router or proxy can surface maps to one
//! variant here, which in turn maps to an HTTP status and a stable error code.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Main error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Renew/status/deregister on an instance the registry does not hold
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No route found for path {0}")]
    NoRouteFound(String),

    #[error("No healthy instance for service {0}")]
    NoHealthyInstance(String),

    /// Every forward attempt for a request failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A single forward attempt exceeded the route timeout
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoRouteFound(_) => StatusCode::NOT_FOUND,
            Self::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code used in JSON error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NoRouteFound(_) => "NO_ROUTE_FOUND",
            Self::NoHealthyInstance(_) => "NO_HEALTHY_INSTANCE",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Auth(_) => "AUTH_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a forward attempt that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_) | Self::Http(_))
    }

    /// Render as a JSON error response
    pub fn to_response(&self, path: &str) -> Response<Full<Bytes>> {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "path": path,
        });

        Response::builder()
            .status(self.status_code())
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"gateway error"))))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Invalid routes file: {}", err))
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
