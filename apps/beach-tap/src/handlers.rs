use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tap_proto::LogEntry;
use tracing::{debug, warn};

use crate::error::{ApiError, TargetError};
use crate::host::{CreatedSession, SessionHost};
use crate::proxy::{ProxyError, ProxyRequest};
use crate::session::SessionSummary;

/// Upper bound on a buffered proxied request body.
pub const MAX_PROXY_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default, alias = "targetAddress")]
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    #[serde(flatten)]
    pub session: CreatedSession,
}

#[derive(Debug, Deserialize)]
pub struct SetTargetRequest {
    #[serde(alias = "targetAddress")]
    pub address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTargetResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResponse {
    pub target_address: Option<String>,
}

/// GET /health - Health check endpoint
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// POST /sessions - Create a session, optionally with its target
pub async fn create_session(
    State(host): State<SessionHost>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice::<CreateSessionRequest>(&body)
            .map_err(|err| ApiError::BadRequest(format!("invalid request body: {err}")))?
    };

    let session = host.create_session(request.target.as_deref()).await?;
    Ok(Json(CreateSessionResponse {
        success: true,
        session,
    }))
}

/// GET /sessions/:id - Target, viewer and log counts
pub async fn get_session_info(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = host.session(&session_id).await?;
    Ok(Json(session.info().await?))
}

/// GET /sessions/:id/target
pub async fn get_target(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<TargetResponse>, ApiError> {
    let session = host.session(&session_id).await?;
    let target_address = session.get_target().await?.map(String::from);
    Ok(Json(TargetResponse { target_address }))
}

/// PUT /sessions/:id/target
pub async fn set_target(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
    Json(request): Json<SetTargetRequest>,
) -> Result<Response, ApiError> {
    let session = host.session(&session_id).await?;
    match session.set_target(&request.address).await {
        Ok(url) => Ok(Json(SetTargetResponse {
            success: true,
            error: None,
            target_address: Some(url.into()),
        })
        .into_response()),
        Err(err @ TargetError::Invalid { .. }) => {
            debug!(session = %session_id, error = %err, "rejected target");
            Ok((
                StatusCode::BAD_REQUEST,
                Json(SetTargetResponse {
                    success: false,
                    error: Some(err.to_string()),
                    target_address: None,
                }),
            )
                .into_response())
        }
        Err(err) => Err(err.into()),
    }
}

/// GET /sessions/:id/logs - Current ledger contents, oldest first
pub async fn list_logs(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let session = host.session(&session_id).await?;
    Ok(Json(session.snapshot()))
}

/// POST /sessions/:id/logs - Append an externally captured entry
pub async fn append_log(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
    Json(entry): Json<LogEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = host.session(&session_id).await?;
    session.log_entry(entry);
    Ok(Json(json!({ "success": true })))
}

/// DELETE /sessions/:id/logs
pub async fn clear_logs(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = host.session(&session_id).await?;
    session.clear_log();
    Ok(Json(json!({ "success": true })))
}

/// ANY /sessions/:id/proxy - Forward to the session target and capture both sides
pub async fn proxy_request(
    State(host): State<SessionHost>,
    Path(session_id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let session = host.session(&session_id).await?;
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES)
        .await
        .map_err(|err| {
            warn!(session = %session_id, error = %err, "failed to read proxied request body");
            ApiError::BadRequest(format!("failed to read request body: {err}"))
        })?;

    let captured = ProxyRequest {
        method: parts.method,
        headers: parts.headers,
        body,
    };
    match host.pipeline().dispatch(session, captured).await {
        Ok(response) => Ok(response.into_response()),
        Err(ProxyError::NotConfigured) => Err(ApiError::NotConfigured),
        Err(ProxyError::Target(err)) => Err(err.into()),
    }
}
