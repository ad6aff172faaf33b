use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use session_store::Session;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Reject the request with 401 unless it carries a live session token.
///
/// The token comes from `Authorization: Bearer`, or, on WebSocket upgrades
/// only, from the `token` query parameter.
pub async fn require_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = session_token(&request);
    if let Err(err) = state.sessions.authorize(token.as_deref()) {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            reason = %err,
            "unauthenticated request rejected"
        );
        return Err(err.into());
    }
    Ok(next.run(request).await)
}

fn session_token(request: &Request) -> Option<String> {
    if let Some(token) = header_token(request.headers()) {
        return Some(token.to_string());
    }
    if !core_gateway::headers::is_websocket_upgrade(request.headers()) {
        return None;
    }
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(session_store::bearer_token)
}

pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Session>, ApiError> {
    let Json(request) = body?;
    let session = state.sessions.login(&request.username, &request.password)?;
    Ok(Json(session))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    if let Some(token) = header_token(&headers) {
        if state.sessions.logout(token) {
            info!("session ended");
        }
    }
    Json(json!({ "status": "ok" }))
}
