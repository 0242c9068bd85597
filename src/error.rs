use axum::http::StatusCode;
use thiserror::Error;

/// Message fragments that mark an otherwise opaque transport error as
/// retryable. Typed variants cover the common cases; this list catches
/// errors that only surface as text from lower layers.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "429",
    "Too Many Requests",
    "502",
    "Bad Gateway",
    "503",
    "Service Unavailable",
    "504",
    "Connection refused",
    "Connection reset",
    "Connection timed out",
    "Timeout",
];

/// HTTP status codes that are re-thrown as retryable failures before
/// classification.
pub const RETRYABLE_STATUS: &[u16] = &[429, 502, 503, 504];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("no route configured for model '{0}'")]
    RouteNotFound(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream returned status {0}")]
    RetryableStatus(u16),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Timeout | ProxyError::Connect(_) => true,
            ProxyError::RetryableStatus(code) => RETRYABLE_STATUS.contains(code),
            ProxyError::Upstream(message) => RETRYABLE_FRAGMENTS
                .iter()
                .any(|fragment| message.contains(fragment)),
            _ => false,
        }
    }

    /// Status code reported to the client when this error surfaces.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Error `type` field in the JSON envelope returned to the client.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) | ProxyError::RouteNotFound(_) => "invalid_request_error",
            _ => "proxy_error",
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout
        } else if err.is_connect() {
            ProxyError::Connect(err.to_string())
        } else {
            ProxyError::Upstream(err.to_string())
        }
    }
}
