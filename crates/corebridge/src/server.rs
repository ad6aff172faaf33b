use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::Request;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use core_gateway::CoreGateway;
use event_bus::{Connection, ConnectionConfig, EventBus};
use serde::Deserialize;
use serde_json::{json, Value};
use session_store::SessionStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Span};

use crate::auth;
use crate::error::ApiError;
use crate::exec::{BackgroundSpec, ProcessRunner, DEFAULT_KILL_TIMEOUT};
use crate::transfer::{DownloadSpec, RequestSpec, TransferResult, Transfers, UploadSpec};

/// How long in-flight requests get to finish once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything the handlers share. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub gateway: Arc<CoreGateway>,
    pub processes: Arc<ProcessRunner>,
    pub transfers: Arc<Transfers>,
    pub connection: ConnectionConfig,
    /// Cancelled to stop the server (signal or `POST /api/exit`).
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(sessions: SessionStore, gateway: CoreGateway) -> Self {
        let bus = Arc::new(EventBus::new());
        Self {
            processes: Arc::new(ProcessRunner::new(Arc::clone(&bus))),
            transfers: Arc::new(Transfers::new(Arc::clone(&bus))),
            bus,
            sessions: Arc::new(sessions),
            gateway: Arc::new(gateway),
            connection: ConnectionConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route("/ws", get(events))
        .route("/api/logout", post(auth::logout))
        .route("/api/exit", post(exit))
        .route("/api/http/request", post(http_request))
        .route("/api/http/download", post(http_download))
        .route("/api/http/upload", post(http_upload))
        .route("/api/exec/background", post(exec_background))
        .route("/api/exec/kill", post(exec_kill))
        .nest_service("/api/core", Arc::clone(&state.gateway).router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(300));

    Router::new()
        .route("/api/login", post(auth::login))
        .merge(private)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(cors)
        .with_state(state)
}

/// The query string is left out: WebSocket clients pass their session token
/// there.
fn request_span(request: &Request<Body>) -> Span {
    info_span!("request", method = %request.method(), path = %request.uri().path())
}

/// Serve until `state.shutdown` is cancelled, then close every event
/// connection and give in-flight requests [`SHUTDOWN_GRACE`] to finish.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let bus = Arc::clone(&state.bus);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            let closed = bus.disconnect_all();
            info!(closed, "shutting down; event connections closed");
        }
    };
    let mut server = tokio::spawn(
        axum::serve(listener, router(state))
            .with_graceful_shutdown(signal)
            .into_future(),
    );

    tokio::select! {
        joined = &mut server => return flatten(joined),
        () = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "requests still running; aborting");
            server.abort();
            Ok(())
        }
    }
}

fn flatten(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> std::io::Result<()> {
    joined.map_err(std::io::Error::other)?
}

async fn events(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let AppState {
        bus, connection, ..
    } = state;
    upgrade
        .max_message_size(connection.max_frame_bytes)
        .on_upgrade(move |socket| Connection::new(bus, connection).serve(socket))
}

async fn exit(State(state): State<AppState>) -> Json<Value> {
    info!("exit requested");
    state.shutdown.cancel();
    Json(json!({ "status": "ok" }))
}

async fn http_request(
    State(state): State<AppState>,
    body: Result<Json<RequestSpec>, JsonRejection>,
) -> Result<Json<TransferResult>, ApiError> {
    let Json(spec) = body?;
    Ok(Json(state.transfers.request(spec).await))
}

async fn http_download(
    State(state): State<AppState>,
    body: Result<Json<DownloadSpec>, JsonRejection>,
) -> Result<Json<TransferResult>, ApiError> {
    let Json(spec) = body?;
    Ok(Json(state.transfers.download(spec).await))
}

async fn http_upload(
    State(state): State<AppState>,
    body: Result<Json<UploadSpec>, JsonRejection>,
) -> Result<Json<TransferResult>, ApiError> {
    let Json(spec) = body?;
    Ok(Json(state.transfers.upload(spec).await))
}

async fn exec_background(
    State(state): State<AppState>,
    body: Result<Json<BackgroundSpec>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(spec) = body?;
    let pid = state.processes.spawn(spec)?;
    Ok(Json(json!({ "ok": true, "pid": pid })))
}

#[derive(Debug, Deserialize)]
struct KillRequest {
    pid: u32,
    /// Seconds between SIGTERM and SIGKILL.
    #[serde(default)]
    timeout: Option<u64>,
}

async fn exec_kill(
    State(state): State<AppState>,
    body: Result<Json<KillRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    let grace = request
        .timeout
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_KILL_TIMEOUT, Duration::from_secs);
    state.processes.kill(request.pid, grace).await?;
    Ok(Json(json!({ "ok": true })))
}
