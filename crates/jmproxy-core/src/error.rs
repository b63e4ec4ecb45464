use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use jmproxy_protocol::openai::error::ErrorResponse;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Dns,
    Tls,
    Connect,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ReadTimeout => "read timeout",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Other => "transport",
        };
        f.write_str(label)
    }
}

/// Failure of a single backend call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("backend credentials are not configured")]
    CredentialMissing,
    #[error("backend rejected the request (code {code}): {message}")]
    BackendRejected { code: i64, message: String },
    #[error("backend returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("{kind} error talking to backend: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("undecodable backend response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no backend session became available within {}ms", waited.as_millis())]
    PoolExhausted { waited: Duration },
}

/// Failure to obtain a configured session for a request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClaimError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Error rendered to the downstream caller as a chat-completion error body.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    pub fn new(status: StatusCode, kind: &str, message: impl Into<String>, code: Option<Value>) -> Self {
        let payload = ErrorResponse::new(kind, message, code);
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        Self {
            status,
            body: Bytes::from(body),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message, None)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message, None)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            message,
            None,
        )
    }
}

impl From<&GatewayError> for ProxyError {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::CredentialMissing => ProxyError::unauthorized(err.to_string()),
            GatewayError::BackendRejected { code, message } => ProxyError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_error",
                format!("Upstream API error: {message}"),
                Some(Value::from(*code)),
            ),
            GatewayError::UpstreamStatus { status, body } => ProxyError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_error",
                format!("Upstream API error ({status}): {body}"),
                Some(Value::from(*status)),
            ),
            GatewayError::Transport { .. } => ProxyError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "network_error",
                format!("Network error: {err}"),
                None,
            ),
            GatewayError::Decode(_) => ProxyError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_error",
                err.to_string(),
                None,
            ),
        }
    }
}

impl From<&ClaimError> for ProxyError {
    fn from(err: &ClaimError) -> Self {
        match err {
            ClaimError::Pool(pool) => ProxyError::service_unavailable(pool.to_string()),
            ClaimError::Gateway(gateway) => ProxyError::from(gateway),
        }
    }
}
