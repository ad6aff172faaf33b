//! Client side of the event protocol.
//!
//! [`ClientMultiplexer`] gives callers `on` / `off` / `emit` over a single
//! WebSocket that it opens lazily, keeps alive across drops, and repairs on
//! every reconnect by re-sending a `subscribe` frame for each event that
//! still has a local listener.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::protocol::{ClientFrame, EventFrame};

/// Local callback for server events.
pub type ClientHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid event endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("multiplexer has been closed")]
    Closed,
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:22345/ws`.
    pub url: Url,
    /// Session token appended as the `token` query parameter. Without one,
    /// no connection is attempted.
    pub token: Option<String>,
    /// First reconnect delay; doubled after each failed attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ClientConfig {
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            url: Url::parse(url)?,
            token: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Returned by [`ClientMultiplexer::on`]; pass to [`ClientMultiplexer::off`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId {
    event: String,
    id: u64,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_event: HashMap<String, HashMap<u64, ClientHandler>>,
}

struct Shared {
    url: Url,
    token: Mutex<Option<String>>,
    initial_backoff: Duration,
    max_backoff: Duration,
    listeners: Mutex<Listeners>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    /// Taken by the driver task when it starts.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    /// Set once a caller has used the channel.
    wanted: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
    connected: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One logical event channel to the server, shared by any number of local
/// listeners.
pub struct ClientMultiplexer {
    shared: Arc<Shared>,
}

impl ClientMultiplexer {
    /// Create a multiplexer. Nothing is dialed until the first
    /// [`on`](Self::on) or [`emit`](Self::emit).
    pub fn new(config: ClientConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                url: config.url,
                token: Mutex::new(config.token),
                initial_backoff: config.initial_backoff,
                max_backoff: config.max_backoff,
                listeners: Mutex::new(Listeners::default()),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                wanted: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                connected,
            }),
        }
    }

    /// Provide (or replace) the session token, e.g. after logging in.
    pub fn set_token(&self, token: impl Into<String>) {
        *lock(&self.shared.token) = Some(token.into());
        if self.shared.wanted.load(Ordering::Acquire) {
            self.ensure_started();
        }
    }

    /// Register `handler` for `event`. The first listener for an event
    /// subscribes to it on the server.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let event = event.into();
        let (id, first) = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.next_id += 1;
            let id = listeners.next_id;
            let handlers = listeners.by_event.entry(event.clone()).or_default();
            handlers.insert(id, Arc::new(handler));
            (id, handlers.len() == 1)
        };
        if first {
            // Already-closed multiplexers have nowhere to send; listeners
            // stay registered but inert.
            let _ = self.shared.outbound.send(ClientFrame::subscribe(event.clone()));
        }
        self.ensure_started();
        ListenerId { event, id }
    }

    /// Remove one listener. Removing the last listener for an event
    /// unsubscribes from it on the server. Returns `false` if `id` was
    /// already removed.
    pub fn off(&self, id: &ListenerId) -> bool {
        let (removed, last) = {
            let mut listeners = lock(&self.shared.listeners);
            let Some(handlers) = listeners.by_event.get_mut(&id.event) else {
                return false;
            };
            let removed = handlers.remove(&id.id).is_some();
            let last = handlers.is_empty();
            if last {
                listeners.by_event.remove(&id.event);
            }
            (removed, last)
        };
        if removed && last {
            let _ = self
                .shared
                .outbound
                .send(ClientFrame::unsubscribe(id.event.clone()));
        }
        removed
    }

    /// Invoke the server-side handlers for `event`. Queued while
    /// disconnected and flushed in order once connected.
    pub fn emit(&self, event: impl Into<String>, payload: Vec<Value>) -> Result<(), ClientError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.shared
            .outbound
            .send(ClientFrame::emit(event, payload))
            .map_err(|_| ClientError::Closed)?;
        self.ensure_started();
        Ok(())
    }

    /// Close the connection for good; no reconnect is attempted afterwards.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    /// Watch the connection state (`true` while a socket is open).
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Number of local listeners for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.shared.listeners)
            .by_event
            .get(event)
            .map_or(0, HashMap::len)
    }

    fn ensure_started(&self) {
        self.shared.wanted.store(true, Ordering::Release);
        if self.shared.shutdown.is_cancelled() || self.shared.started.load(Ordering::Acquire) {
            return;
        }
        if lock(&self.shared.token).is_none() {
            debug!("no session token; event connection not started");
            return;
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(outbound) = lock(&self.shared.outbound_rx).take() else {
            return;
        };
        tokio::spawn(drive(Arc::clone(&self.shared), outbound));
    }
}

impl Drop for ClientMultiplexer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for ClientMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMultiplexer")
            .field("url", &self.shared.url.as_str())
            .field("connected", &*self.shared.connected.borrow())
            .finish()
    }
}

impl Shared {
    fn endpoint(&self) -> Option<Url> {
        let token = lock(&self.token).clone()?;
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", &token);
        Some(url)
    }

    fn active_events(&self) -> Vec<String> {
        lock(&self.listeners).by_event.keys().cloned().collect()
    }

    fn dispatch(&self, raw: &[u8]) {
        let frame: EventFrame = match serde_json::from_slice(raw) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "ignoring undecodable server frame");
                return;
            }
        };
        let handlers: Vec<ClientHandler> = lock(&self.listeners)
            .by_event
            .get(&frame.event)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&frame.payload))).is_err() {
                error!(event = %frame.event, "client listener panicked");
            }
        }
    }
}

/// How a live session ended.
enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Connect, run, and reconnect with capped exponential backoff until
/// shutdown.
async fn drive(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<ClientFrame>) {
    // Frames taken off the channel but not yet written.
    let mut pending: VecDeque<ClientFrame> = VecDeque::new();
    let mut backoff = shared.initial_backoff;

    loop {
        if let Some(url) = shared.endpoint() {
            let attempt = tokio::select! {
                () = shared.shutdown.cancelled() => return,
                attempt = tokio_tungstenite::connect_async(url.as_str()) => attempt,
            };
            match attempt {
                Ok((socket, _)) => {
                    info!(url = %shared.url, "event connection established");
                    backoff = shared.initial_backoff;
                    shared.connected.send_replace(true);
                    let end = run_session(&shared, socket, &mut outbound, &mut pending).await;
                    shared.connected.send_replace(false);
                    if matches!(end, SessionEnd::Shutdown) {
                        return;
                    }
                    debug!("event connection dropped");
                }
                Err(err) => warn!(url = %shared.url, %err, "event connection failed"),
            }
        }

        tokio::select! {
            () = shared.shutdown.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(shared.max_backoff);
    }
}

async fn run_session(
    shared: &Shared,
    socket: Socket,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    pending: &mut VecDeque<ClientFrame>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    for event in shared.active_events() {
        if sink.send(encode(&ClientFrame::subscribe(event))).await.is_err() {
            return SessionEnd::Dropped;
        }
    }
    while let Some(frame) = pending.pop_front() {
        if sink.send(encode(&frame)).await.is_err() {
            pending.push_front(frame);
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return SessionEnd::Shutdown };
                if sink.send(encode(&frame)).await.is_err() {
                    pending.push_front(frame);
                    return SessionEnd::Dropped;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => shared.dispatch(&bytes),
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%err, "event connection read failed");
                    return SessionEnd::Dropped;
                }
            },
        }
    }
}

fn encode(frame: &ClientFrame) -> Message {
    // ClientFrame holds only strings and JSON values.
    Message::text(serde_json::to_string(frame).unwrap_or_default())
}
