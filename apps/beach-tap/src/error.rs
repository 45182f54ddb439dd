use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid target address `{address}`: {reason}")]
    Invalid { address: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure forwarding one request to the configured target.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("failed to read upstream response body: {0}")]
    Body(#[source] reqwest::Error),
}

impl UpstreamError {
    pub fn status_text(&self) -> &'static str {
        match self {
            UpstreamError::Timeout(_) => "Upstream Timeout",
            UpstreamError::Request(_) => "Upstream Request Failed",
            UpstreamError::Body(_) => "Upstream Body Unreadable",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            UpstreamError::Timeout(_) => "upstream_timeout",
            UpstreamError::Request(_) => "upstream_unreachable",
            UpstreamError::Body(_) => "upstream_body_unreadable",
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// Proxy invoked before a target was configured.
    NotConfigured,
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody<'a> {
    pub error: &'a str,
    pub message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::NotConfigured => (
                StatusCode::BAD_REQUEST,
                "target_not_configured",
                Some("no target address configured for this session".to_string()),
            ),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(msg))
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NotFound(id) => ApiError::NotFound(format!("session {id} not found")),
            HostError::Target(err) => err.into(),
            HostError::Storage(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<TargetError> for ApiError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Invalid { .. } => ApiError::BadRequest(err.to_string()),
            TargetError::Storage(err) => ApiError::Internal(err.to_string()),
        }
    }
}
