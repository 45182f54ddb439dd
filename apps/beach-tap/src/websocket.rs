use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::fanout::ViewerHandle;
use crate::host::SessionHost;
use crate::session::InterceptorSession;

/// WebSocket upgrade handler for live viewers
pub async fn viewer_websocket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(host): State<SessionHost>,
) -> Response {
    // Unknown sessions are refused before upgrading.
    let session = match host.session(&session_id).await {
        Ok(session) => session,
        Err(err) => return ApiError::from(err).into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, session, host))
}

async fn handle_socket(socket: WebSocket, session: Arc<InterceptorSession>, host: SessionHost) {
    let session_id = session.id().to_string();
    let (mut sender, mut receiver) = socket.split();
    let queue_capacity = host.config().viewer_queue_capacity;
    let (handle, mut rx) = ViewerHandle::channel(&session_id, queue_capacity);
    let viewer_id = handle.viewer_id().to_string();

    // Forward queued events to the socket until a write fails or the session
    // evicts this viewer for falling behind.
    let writer_viewer = viewer_id.clone();
    let eviction = handle.clone();
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = eviction.evicted() => {
                    warn!(viewer = %writer_viewer, "closing stalled viewer");
                    break;
                }
            };
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(viewer = %writer_viewer, "failed to encode viewer event: {}", e),
            }
        }
        let _ = sender.close().await;
        debug!(viewer = %writer_viewer, "viewer writer task ended");
    });

    if !host.attach_viewer(&session, handle) {
        writer.abort();
        return;
    }
    // The host keeps the handle; this task only needs it for cleanup.
    drop(session);
    info!(session = %session_id, viewer = %viewer_id, "viewer connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!(viewer = %viewer_id, "viewer socket error: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => inspect_viewer_message(&viewer_id, text.as_bytes()),
            Message::Binary(data) => inspect_viewer_message(&viewer_id, &data),
            Message::Close(_) => {
                debug!(viewer = %viewer_id, "received close frame");
                break;
            }
            _ => {}
        }
    }

    host.detach_viewer(&session_id, &viewer_id);
    writer.abort();
    info!(session = %session_id, viewer = %viewer_id, "viewer disconnected");
}

/// Viewers have no commands; anything they send is parsed for the debug log
/// and dropped.
fn inspect_viewer_message(viewer_id: &str, payload: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => debug!(viewer = %viewer_id, message = %value, "ignoring viewer message"),
        Err(e) => debug!(viewer = %viewer_id, "ignoring malformed viewer message: {}", e),
    }
}
