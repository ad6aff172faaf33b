use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use event_bus::{Connection, ConnectionConfig, EventBus};
use serde::Deserialize;
use tokio::net::TcpListener;

pub const TOKEN: &str = "test-token";

#[derive(Clone)]
struct AppState {
    bus: Arc<EventBus>,
    config: ConnectionConfig,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    if query.token.as_deref() != Some(TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| Connection::new(state.bus, state.config).serve(socket))
}

/// Serve `/ws` on an ephemeral loopback port and return its address.
pub async fn spawn_server(bus: Arc<EventBus>, config: ConnectionConfig) -> SocketAddr {
    let app = Router::new()
        .route("/ws", get(upgrade))
        .with_state(AppState { bus, config });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
