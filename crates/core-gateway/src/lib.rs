//! Authenticated reverse proxy to the local core's control API.
//!
//! The browser names the upstream per request (`X-Core-Base` header or
//! `coreBase` query) together with an optional upstream credential
//! (`X-Core-Bearer` / `coreBearer`). The gateway only ever dials loopback
//! bases (see [`net_guard`]), injects the credential as a bearer token, and
//! relays either a plain HTTP exchange or a WebSocket session.
//!
//! # Architecture
//!
//! ```text
//! browser  --HTTP/WS-->  /api/core/*  --HTTP/WS-->  127.0.0.1:<core port>
//!                            |
//!                  [loopback guard, header filter,
//!                   bearer injection]
//! ```
//!
//! Mount [`CoreGateway::router`] under a prefix with `Router::nest`; the
//! path below the prefix becomes the upstream path.

mod error;
mod forward;
pub mod headers;
mod target;
mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

pub use error::GatewayError;
pub use forward::MAX_BODY_BYTES;
pub use target::ProxyTarget;

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-request timeout for the HTTP path, body included.
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// The reverse proxy. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CoreGateway {
    client: reqwest::Client,
}

impl CoreGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        // Upstream 3xx responses are relayed as-is; following them could leave
        // loopback. Environment proxies are ignored for the same reason.
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Routes for `/` and everything below it, all methods.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", any(proxy))
            .route("/{*rest}", any(proxy))
            .with_state(self)
    }

    /// Forward one request. The request URI path is taken as the upstream
    /// path.
    pub async fn forward(&self, request: Request) -> Result<Response, GatewayError> {
        let target = ProxyTarget::resolve(request.headers(), request.uri())?;

        if headers::is_websocket_upgrade(request.headers()) {
            let (mut parts, _) = request.into_parts();
            let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
                .await
                .map_err(|rejection| GatewayError::Handshake {
                    status: rejection.status(),
                    message: rejection.body_text(),
                })?;
            return tunnel::forward_websocket(upgrade, &target).await;
        }

        forward::forward_http(&self.client, request, &target).await
    }
}

async fn proxy(State(gateway): State<Arc<CoreGateway>>, request: Request) -> Response {
    match gateway.forward(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
