#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use core_gateway::{CoreGateway, GatewayConfig};
use corebridge::AppState;
use serde_json::{json, Value};
use session_store::{Credentials, SessionStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "correct horse";

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub handle: JoinHandle<std::io::Result<()>>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub async fn start() -> Self {
        let sessions = SessionStore::new(Credentials::new(USERNAME, PASSWORD));
        let gateway = CoreGateway::new(GatewayConfig::default()).unwrap();
        let state = AppState::new(sessions, gateway);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(corebridge::serve(listener, state.clone()));

        Self {
            addr,
            state,
            handle,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn login(&self) -> String {
        let body: Value = self
            .client
            .post(self.url("/api/login"))
            .json(&json!({ "username": USERNAME, "password": PASSWORD }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    /// POST `body` to `path` with a session token and return status and JSON.
    pub async fn call(&self, token: &str, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }
}

/// Serve `app` on an ephemeral loopback port.
pub async fn serve_upstream(app: axum::Router) -> SocketAddr {
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
