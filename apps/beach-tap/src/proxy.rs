use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tap_proto::{body_text, LogEntry};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{TargetError, UpstreamError};
use crate::session::InterceptorSession;

/// Headers the outbound client recomputes rather than copying verbatim.
static RECOMPUTED_HEADERS: [HeaderName; 4] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Inbound request as captured at the proxy endpoint.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no target address configured")]
    NotConfigured,
    #[error(transparent)]
    Target(#[from] TargetError),
}

#[derive(Clone)]
pub struct ProxyPipeline {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProxyPipeline {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Runs one exchange on a detached task so logging still completes if the
    /// caller goes away mid-forward.
    pub async fn dispatch(
        &self,
        session: Arc<InterceptorSession>,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let pipeline = self.clone();
        let handle = tokio::spawn(async move { pipeline.forward(&session, request).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                warn!(error = %join_err, "proxy task aborted");
                Ok(failure_response(&json!({
                    "error": "proxy_task_failed",
                    "message": join_err.to_string(),
                })))
            }
        }
    }

    /// Forwards `request` to the session's target, recording both sides in
    /// the session ledger. Upstream failures become a logged, synthesized 500.
    pub async fn forward(
        &self,
        session: &InterceptorSession,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let target = session.get_target().await?.ok_or(ProxyError::NotConfigured)?;
        session.touch();

        let request_id = Uuid::new_v4().to_string();
        session.log_entry(LogEntry::request(
            request_id.clone(),
            request.method.as_str(),
            target.as_str(),
            header_map(&request.headers),
            body_text(&request.body),
        ));
        debug!(
            session = %session.id(),
            request_id = %request_id,
            method = %request.method,
            target = %target,
            bytes = request.body.len(),
            "forwarding request"
        );

        let mut outbound = request.headers.clone();
        for name in &RECOMPUTED_HEADERS {
            outbound.remove(name);
        }
        let send = async {
            let upstream = self
                .client
                .request(request.method.clone(), target.clone())
                .headers(outbound)
                .body(request.body.clone())
                .send()
                .await
                .map_err(UpstreamError::Request)?;
            let status = upstream.status();
            let headers = upstream.headers().clone();
            let body = upstream.bytes().await.map_err(UpstreamError::Body)?;
            Ok::<_, UpstreamError>(ProxyResponse {
                status,
                headers,
                body,
            })
        };

        let outcome = match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(mut response) => {
                response.headers.remove(header::TRANSFER_ENCODING);
                response.headers.remove(header::CONNECTION);
                session.log_entry(LogEntry::response(
                    &request_id,
                    response.status.as_u16(),
                    response.status.canonical_reason().unwrap_or_default(),
                    header_map(&response.headers),
                    body_text(&response.body),
                ));
                debug!(
                    session = %session.id(),
                    request_id = %request_id,
                    status = response.status.as_u16(),
                    "upstream responded"
                );
                Ok(response)
            }
            Err(err) => {
                warn!(
                    session = %session.id(),
                    request_id = %request_id,
                    error = %err,
                    "upstream forward failed"
                );
                let detail = json!({ "error": err.code(), "message": err.to_string() });
                session.log_entry(LogEntry::error(
                    &request_id,
                    err.status_text(),
                    detail.to_string(),
                ));
                Ok(failure_response(&detail))
            }
        }
    }
}

fn failure_response(detail: &serde_json::Value) -> ProxyResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    ProxyResponse {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        headers,
        body: Bytes::from(detail.to_string()),
    }
}

/// Flattens headers for logging; repeated names are joined with ", ".
pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::ViewerHandle;
    use crate::storage::Storage;
    use axum::{routing::any, Router};
    use chrono::Utc;
    use tap_proto::{Direction, ViewerEvent};
    use tokio::net::TcpListener;

    async fn spawn_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn session() -> Arc<InterceptorSession> {
        Arc::new(InterceptorSession::new(
            "sess".into(),
            Utc::now(),
            Storage::memory(),
            100,
        ))
    }

    fn post(body: &'static str) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(header::HOST, "tap.local".parse().unwrap());
        ProxyRequest {
            method: Method::POST,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn pipeline(timeout: Duration) -> ProxyPipeline {
        ProxyPipeline::new(reqwest::Client::new(), timeout)
    }

    /// Upstream that waits `x-delay` milliseconds, then echoes the body.
    fn delayed_echo() -> Router {
        Router::new().route(
            "/echo",
            any(|headers: HeaderMap, body: String| async move {
                let delay = headers
                    .get("x-delay")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                format!("echo:{body}")
            }),
        )
    }

    fn delayed_post(body: String, delay_ms: u64) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-delay", delay_ms.to_string().parse().unwrap());
        ProxyRequest {
            method: Method::POST,
            headers,
            body: Bytes::from(body),
        }
    }

    #[tokio::test]
    async fn missing_target_is_rejected_without_logging() {
        let session = session();
        let err = pipeline(Duration::from_secs(5))
            .forward(&session, post("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotConfigured));
        assert_eq!(session.log_count(), 0);
    }

    #[tokio::test]
    async fn successful_exchange_logs_request_then_response() {
        let upstream = spawn_upstream(Router::new().route(
            "/mcp",
            any(|body: String| async move {
                (
                    StatusCode::CREATED,
                    [("x-upstream", "yes")],
                    format!("echo:{body}"),
                )
            }),
        ))
        .await;
        let session = session();
        session
            .set_target(&format!("{upstream}/mcp"))
            .await
            .unwrap();
        let (viewer, mut rx) = ViewerHandle::channel("sess", 16);
        session.register_viewer(viewer);

        let response = pipeline(Duration::from_secs(5))
            .dispatch(session.clone(), post(r#"{"jsonrpc":"2.0","method":"ping"}"#))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers.get("x-upstream").unwrap(), "yes");
        assert_eq!(
            &response.body[..],
            br#"echo:{"jsonrpc":"2.0","method":"ping"}"#
        );

        let logs = session.snapshot();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].direction, Direction::Request);
        assert_eq!(logs[0].method.as_deref(), Some("POST"));
        assert_eq!(
            logs[0].body.as_deref(),
            Some(r#"{"jsonrpc":"2.0","method":"ping"}"#)
        );
        assert_eq!(logs[0].url.as_deref(), Some(format!("{upstream}/mcp").as_str()));
        assert_eq!(logs[1].id, format!("{}-response", logs[0].id));
        assert_eq!(logs[1].status, Some(201));
        assert_eq!(logs[1].status_text.as_deref(), Some("Created"));

        assert!(matches!(rx.recv().await, Some(ViewerEvent::InitialLogs { .. })));
        match rx.recv().await {
            Some(ViewerEvent::NewLog { log }) => assert_eq!(log.id, logs[0].id),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await {
            Some(ViewerEvent::NewLog { log }) => assert_eq!(log.id, logs[1].id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_exchanges_pair_responses_with_their_requests() {
        let upstream = spawn_upstream(delayed_echo()).await;
        let session = session();
        session
            .set_target(&format!("{upstream}/echo"))
            .await
            .unwrap();
        let pipeline = pipeline(Duration::from_secs(5));

        // Later requests finish first so completion order differs from send order.
        let calls = (0..40u64).map(|n| {
            let payload = format!("payload-{n}");
            pipeline.dispatch(session.clone(), delayed_post(payload, (40 - n) * 5))
        });
        let responses = futures_util::future::join_all(calls).await;

        for (n, response) in responses.into_iter().enumerate() {
            let response = response.unwrap();
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(&response.body[..], format!("echo:payload-{n}").as_bytes());
        }

        let logs = session.snapshot();
        assert_eq!(logs.len(), 80);
        let requests: Vec<_> = logs
            .iter()
            .filter(|l| l.direction == Direction::Request)
            .collect();
        assert_eq!(requests.len(), 40);
        for request in requests {
            let payload = request.body.as_deref().unwrap();
            let matching: Vec<_> = logs
                .iter()
                .filter(|l| l.id == format!("{}-response", request.id))
                .collect();
            assert_eq!(matching.len(), 1, "request {} not paired once", request.id);
            assert_eq!(
                matching[0].body.as_deref(),
                Some(format!("echo:{payload}").as_str())
            );
        }
    }

    #[tokio::test]
    async fn abandoned_caller_still_logs_both_sides() {
        let upstream = spawn_upstream(delayed_echo()).await;
        let session = session();
        session
            .set_target(&format!("{upstream}/echo"))
            .await
            .unwrap();

        let pipeline = pipeline(Duration::from_secs(5));
        let call = pipeline.dispatch(session.clone(), delayed_post("late".into(), 300));
        assert!(tokio::time::timeout(Duration::from_millis(50), call)
            .await
            .is_err());
        assert_eq!(session.log_count(), 1);

        tokio::time::timeout(Duration::from_secs(3), async {
            while session.log_count() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("response entry was never logged");

        let logs = session.snapshot();
        assert_eq!(logs[1].id, format!("{}-response", logs[0].id));
        assert_eq!(logs[1].status, Some(200));
        assert_eq!(logs[1].body.as_deref(), Some("echo:late"));
    }

    #[tokio::test]
    async fn unreachable_target_yields_logged_500() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = session();
        session
            .set_target(&format!("http://{addr}/mcp"))
            .await
            .unwrap();

        let response = pipeline(Duration::from_secs(5))
            .forward(&session, post("{}"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "upstream_unreachable");

        let logs = session.snapshot();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].id, format!("{}-error", logs[0].id));
        assert_eq!(logs[1].status, Some(500));
        assert_eq!(logs[1].status_text.as_deref(), Some("Upstream Request Failed"));
        assert_eq!(logs[1].body.as_deref(), Some(body.to_string().as_str()));
    }

    #[tokio::test]
    async fn slow_target_times_out() {
        let upstream = spawn_upstream(Router::new().route(
            "/slow",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let session = session();
        session
            .set_target(&format!("{upstream}/slow"))
            .await
            .unwrap();

        let response = pipeline(Duration::from_millis(200))
            .forward(&session, post("{}"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        let logs = session.snapshot();
        assert_eq!(logs[1].status_text.as_deref(), Some("Upstream Timeout"));
    }

    #[tokio::test]
    async fn binary_bodies_are_logged_as_sentinel() {
        let upstream = spawn_upstream(Router::new().route(
            "/bin",
            any(|| async { vec![0xffu8, 0x00, 0xfe] }),
        ))
        .await;
        let session = session();
        session
            .set_target(&format!("{upstream}/bin"))
            .await
            .unwrap();

        let response = pipeline(Duration::from_secs(5))
            .forward(&session, post("{}"))
            .await
            .unwrap();
        assert_eq!(&response.body[..], &[0xffu8, 0x00, 0xfe]);
        assert_eq!(
            session.snapshot()[1].body.as_deref(),
            Some(tap_proto::BINARY_BODY_SENTINEL)
        );
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", "text/plain".parse().unwrap());
        headers.append("accept", "application/json".parse().unwrap());
        let flat = header_map(&headers);
        assert_eq!(flat["accept"], "text/plain, application/json");
    }
}
