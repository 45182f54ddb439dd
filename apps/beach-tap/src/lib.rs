pub mod cli;
pub mod config;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod host;
pub mod ledger;
pub mod proxy;
pub mod session;
pub mod storage;
pub mod target;
pub mod websocket;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    append_log, clear_logs, create_session, get_session_info, get_target, health_check,
    list_logs, proxy_request, set_target,
};
use crate::host::SessionHost;
use crate::websocket::viewer_websocket;

pub fn build_router(host: SessionHost) -> Router {
    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session_info))
        .route("/sessions/:id/target", get(get_target).put(set_target))
        .route(
            "/sessions/:id/logs",
            get(list_logs).post(append_log).delete(clear_logs),
        )
        .route("/sessions/:id/proxy", any(proxy_request));

    let ws_routes = Router::new().route("/ws/:id", get(viewer_websocket));

    Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}
