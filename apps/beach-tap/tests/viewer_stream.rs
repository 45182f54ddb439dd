use axum::{routing::post, Json, Router};
use beach_tap::{build_router, config::Config, host::SessionHost, storage::Storage};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tap_proto::{Direction, LogEntry, ViewerEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

async fn start_tap() -> String {
    let host = SessionHost::new(Config::default(), Storage::memory());
    serve(build_router(host)).await
}

async fn next_event(viewer: &mut Viewer) -> ViewerEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), viewer.next())
            .await
            .expect("timed out waiting for viewer event")
            .expect("viewer stream ended")
            .expect("viewer stream error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn create_session(tap: &str, target: &str) -> String {
    let body: Value = reqwest::Client::new()
        .post(format!("http://{tap}/sessions"))
        .json(&json!({ "target": target }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["sessionId"].as_str().unwrap().to_string()
}

fn expect_new_log(event: ViewerEvent) -> LogEntry {
    match event {
        ViewerEvent::NewLog { log } => log,
        other => panic!("expected new_log, got {other:?}"),
    }
}

#[tokio::test]
async fn proxied_exchange_reaches_prior_and_later_viewers() {
    let upstream = serve(Router::new().route(
        "/mcp",
        post(|Json(body): Json<Value>| async move {
            Json(json!({ "jsonrpc": "2.0", "id": body["id"].clone(), "result": {} }))
        }),
    ))
    .await;
    let tap = start_tap().await;
    let session_id = create_session(&tap, &format!("http://{upstream}/mcp")).await;

    let (mut prior, _) = connect_async(format!("ws://{tap}/ws/{session_id}"))
        .await
        .unwrap();
    match next_event(&mut prior).await {
        ViewerEvent::InitialLogs { logs } => assert!(logs.is_empty()),
        other => panic!("expected initial_logs, got {other:?}"),
    }

    let payload = r#"{"jsonrpc":"2.0","method":"ping","id":1}"#;
    let response = reqwest::Client::new()
        .post(format!("http://{tap}/sessions/{session_id}/proxy"))
        .header("content-type", "application/json")
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["id"], 1);

    let request = expect_new_log(next_event(&mut prior).await);
    assert_eq!(request.direction, Direction::Request);
    assert_eq!(request.method.as_deref(), Some("POST"));
    assert_eq!(request.body.as_deref(), Some(payload));

    let reply = expect_new_log(next_event(&mut prior).await);
    assert_eq!(reply.direction, Direction::Response);
    assert_eq!(reply.id, format!("{}-response", request.id));
    assert_eq!(reply.status, Some(200));

    let (mut later, _) = connect_async(format!("ws://{tap}/ws/{session_id}"))
        .await
        .unwrap();
    match next_event(&mut later).await {
        ViewerEvent::InitialLogs { logs } => assert_eq!(logs, vec![request, reply]),
        other => panic!("expected initial_logs, got {other:?}"),
    }
}

#[tokio::test]
async fn viewer_chatter_is_ignored_and_clear_is_broadcast() {
    let tap = start_tap().await;
    let session_id = create_session(&tap, "https://example.test/mcp").await;
    let (mut viewer, _) = connect_async(format!("ws://{tap}/ws/{session_id}"))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut viewer).await,
        ViewerEvent::InitialLogs { .. }
    ));

    viewer
        .send(Message::Text("definitely not json".into()))
        .await
        .unwrap();
    viewer
        .send(Message::Text(r#"{"type":"subscribe"}"#.into()))
        .await
        .unwrap();

    let status = reqwest::Client::new()
        .delete(format!("http://{tap}/sessions/{session_id}/logs"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);
    assert_eq!(next_event(&mut viewer).await, ViewerEvent::LogsCleared);

    let info: Value = reqwest::get(format!("http://{tap}/sessions/{session_id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["viewerCount"], 1);
}

#[tokio::test]
async fn unknown_session_refuses_viewer() {
    let tap = start_tap().await;
    let result = connect_async(format!("ws://{tap}/ws/no-such-session")).await;
    assert!(result.is_err());
}
