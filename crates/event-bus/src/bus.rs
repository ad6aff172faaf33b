use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::protocol::EventFrame;

/// Identity of one attached connection.
pub type ConnectionId = uuid::Uuid;

/// Server-side callback for events emitted by clients.
pub type Handler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Capacity of every connection's outbound queue.
pub const QUEUE_CAPACITY: usize = 64;

/// The bus-facing half of a connection: its identity, its bounded outbound
/// queue and its liveness signal.
///
/// The receiving end of the queue belongs to whoever writes to the socket
/// (see [`crate::Connection`]).
pub struct Subscriber {
    id: ConnectionId,
    queue: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    closing: AtomicBool,
}

impl Subscriber {
    /// Create a subscriber with a fresh identity and a queue of `capacity`.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (queue, rx) = mpsc::channel(capacity);
        let subscriber = Arc::new(Self {
            id: uuid::Uuid::new_v4(),
            queue,
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
        });
        (subscriber, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Push a serialized frame onto the outbound queue.
    ///
    /// Waits while the queue is full. Returns `false` without delivering if
    /// the connection closes first.
    pub async fn enqueue(&self, message: Arc<str>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(message)) => {
                debug!(connection_id = %self.id, "outbound queue full; waiting for writer");
                tokio::select! {
                    biased;
                    () = self.closed.cancelled() => false,
                    sent = self.queue.send(message) => sent.is_ok(),
                }
            }
        }
    }

    /// Flip the liveness signal. Only the first call returns `true`.
    fn mark_closed(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        true
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle returned by [`EventBus::on`]; pass it to [`EventBus::off`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId {
    event: String,
    id: u64,
}

impl HandlerId {
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Deregisters its handler when dropped.
#[must_use = "the handler is removed as soon as the guard is dropped"]
pub struct HandlerGuard {
    bus: Arc<EventBus>,
    id: HandlerId,
}

impl HandlerGuard {
    pub fn id(&self) -> &HandlerId {
        &self.id
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.bus.off(&self.id);
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Arc<Subscriber>>,
    subscribers: HashMap<String, HashMap<ConnectionId, Arc<Subscriber>>>,
    handlers: HashMap<String, HashMap<u64, Handler>>,
    next_handler_id: u64,
}

/// Routes named events between server-side code and attached connections.
///
/// Two registries share one lock: event name to subscribed connections
/// (fed by client `subscribe` frames, drained by [`emit`](Self::emit)) and
/// event name to server-side handlers (registered with [`on`](Self::on),
/// invoked when a client sends an `emit` frame).
#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a live connection so [`disconnect_all`](Self::disconnect_all)
    /// can reach it.
    pub fn attach(&self, subscriber: &Arc<Subscriber>) {
        // Checked under the lock: `close` marks the subscriber before it
        // takes the lock to remove it.
        let mut registry = self.write();
        if subscriber.is_closed() {
            return;
        }
        registry
            .connections
            .insert(subscriber.id(), Arc::clone(subscriber));
    }

    pub fn subscribe(&self, event: &str, subscriber: &Arc<Subscriber>) {
        let mut registry = self.write();
        if subscriber.is_closed() {
            return;
        }
        registry
            .subscribers
            .entry(event.to_string())
            .or_default()
            .insert(subscriber.id(), Arc::clone(subscriber));
    }

    pub fn unsubscribe(&self, event: &str, id: ConnectionId) {
        let mut registry = self.write();
        if let Some(subs) = registry.subscribers.get_mut(event) {
            subs.remove(&id);
            if subs.is_empty() {
                registry.subscribers.remove(event);
            }
        }
    }

    /// Drop `id` from every subscriber set and from the connection table.
    pub fn remove_subscriber(&self, id: ConnectionId) {
        let mut registry = self.write();
        registry.connections.remove(&id);
        registry.subscribers.retain(|_, subs| {
            subs.remove(&id);
            !subs.is_empty()
        });
    }

    /// Close a connection: fire its liveness signal so the socket tasks wind
    /// down, then unregister it everywhere.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&self, subscriber: &Subscriber) -> bool {
        if !subscriber.mark_closed() {
            return false;
        }
        self.remove_subscriber(subscriber.id());
        true
    }

    /// Close every attached connection.
    pub fn disconnect_all(&self) -> usize {
        let connections: Vec<Arc<Subscriber>> = self.read().connections.values().cloned().collect();
        connections.iter().filter(|conn| self.close(conn)).count()
    }

    /// Broadcast `{event, payload}` to every connection subscribed to `event`.
    ///
    /// The frame is serialized once. The lock is held only to snapshot the
    /// subscriber set; enqueueing happens afterwards and waits on full
    /// queues until space frees up or the connection closes. Returns the
    /// number of connections the frame was queued for.
    pub async fn emit(&self, event: &str, payload: Vec<Value>) -> usize {
        let frame = EventFrame {
            event: event.to_string(),
            payload,
        };
        let message: Arc<str> = match serde_json::to_string(&frame) {
            Ok(json) => json.into(),
            Err(err) => {
                warn!(event, %err, "dropping emit: payload failed to serialize");
                return 0;
            }
        };

        let recipients: Vec<Arc<Subscriber>> = self
            .read()
            .subscribers
            .get(event)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for subscriber in recipients {
            if subscriber.enqueue(Arc::clone(&message)).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Register a handler for `event` frames emitted by clients.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut registry = self.write();
        registry.next_handler_id += 1;
        let id = registry.next_handler_id;
        registry
            .handlers
            .entry(event.clone())
            .or_default()
            .insert(id, Arc::new(handler));
        HandlerId { event, id }
    }

    /// Like [`on`](Self::on), but the handler lives only as long as the
    /// returned guard.
    pub fn on_scoped<F>(self: &Arc<Self>, event: impl Into<String>, handler: F) -> HandlerGuard
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let id = self.on(event, handler);
        HandlerGuard {
            bus: Arc::clone(self),
            id,
        }
    }

    /// Remove exactly the handler behind `id`. Returns `false` if it was
    /// already gone.
    pub fn off(&self, id: &HandlerId) -> bool {
        let mut registry = self.write();
        let Some(handlers) = registry.handlers.get_mut(&id.event) else {
            return false;
        };
        let removed = handlers.remove(&id.id).is_some();
        if handlers.is_empty() {
            registry.handlers.remove(&id.event);
        }
        removed
    }

    /// Run every handler registered for `event` with `payload`.
    ///
    /// Handlers are snapshotted under the read lock and called after it is
    /// released, so a handler may call [`off`](Self::off) on itself. Order
    /// is unspecified. A panicking handler is logged and does not stop the
    /// others. Returns the number of handlers invoked.
    pub fn dispatch_from_connection(&self, event: &str, payload: &[Value]) -> usize {
        let handlers: Vec<Handler> = self
            .read()
            .handlers
            .get(event)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!(event, "event handler panicked");
            }
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.read().subscribers.get(event).map_or(0, HashMap::len)
    }

    pub fn is_subscribed(&self, event: &str, id: ConnectionId) -> bool {
        self.read()
            .subscribers
            .get(event)
            .is_some_and(|subs| subs.contains_key(&id))
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.read().handlers.get(event).map_or(0, HashMap::len)
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.read();
        f.debug_struct("EventBus")
            .field("connections", &registry.connections.len())
            .field("events", &registry.subscribers.len())
            .field("handled_events", &registry.handlers.len())
            .finish()
    }
}
