use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::bus::{EventBus, Subscriber, QUEUE_CAPACITY};
use crate::protocol::{Action, ClientFrame};

/// Largest inbound frame a connection accepts.
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

/// Pending control frames (pongs) the reader may hand to the writer.
const CONTROL_CAPACITY: usize = 8;

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    /// Silence allowed between pongs before the peer is considered dead.
    pub read_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Deadline for writing a control frame.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY,
            max_frame_bytes: MAX_FRAME_BYTES,
            read_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a connection stopped.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("no pong received within {0:?}")]
    ReadTimeout(Duration),

    #[error("control frame write timed out")]
    WriteTimeout,

    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

/// Server side of one event socket.
///
/// [`serve`](Self::serve) attaches the socket to the bus and runs two loops
/// until either fails: the reader (on the calling task) decodes
/// [`ClientFrame`]s in arrival order, and the writer (a spawned task) drains
/// the outbound queue and sends heartbeat pings. Whichever side stops first
/// closes the connection through [`EventBus::close`], which stops the other.
pub struct Connection {
    bus: Arc<EventBus>,
    config: ConnectionConfig,
}

impl Connection {
    pub fn new(bus: Arc<EventBus>, config: ConnectionConfig) -> Self {
        Self { bus, config }
    }

    pub async fn serve<S>(self, socket: S)
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + 'static,
    {
        let (subscriber, queue) = Subscriber::new(self.config.queue_capacity);
        self.bus.attach(&subscriber);
        let connection_id = subscriber.id();
        info!(%connection_id, "event connection opened");

        let (sink, stream) = socket.split();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            control_rx,
            Arc::clone(&self.bus),
            Arc::clone(&subscriber),
            self.config.clone(),
        ));

        let mut reader = Reader {
            bus: Arc::clone(&self.bus),
            subscriber: Arc::clone(&subscriber),
            control: control_tx,
            events: HashSet::new(),
            config: self.config,
        };
        match reader.run(stream).await {
            Ok(()) => debug!(%connection_id, "peer went away"),
            Err(err) => debug!(%connection_id, %err, "reader stopped"),
        }
        self.bus.close(&subscriber);

        if let Err(err) = writer.await {
            debug!(%connection_id, %err, "writer task ended abnormally");
        }
        info!(
            %connection_id,
            subscriptions = reader.events.len(),
            "event connection closed"
        );
    }
}

struct Reader {
    bus: Arc<EventBus>,
    subscriber: Arc<Subscriber>,
    control: mpsc::Sender<Message>,
    /// Events this peer asked for.
    events: HashSet<String>,
    config: ConnectionConfig,
}

impl Reader {
    async fn run<R>(&mut self, mut stream: R) -> Result<(), ConnectionError>
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let mut deadline = Instant::now() + self.config.read_timeout;

        loop {
            let next = tokio::select! {
                () = self.subscriber.closed() => return Ok(()),
                next = timeout_at(deadline, stream.next()) => next,
            };
            let message = match next {
                Err(_) => return Err(ConnectionError::ReadTimeout(self.config.read_timeout)),
                Ok(None) => return Ok(()),
                Ok(Some(result)) => result?,
            };

            match message {
                Message::Text(text) => self.handle(text.as_str().as_bytes())?,
                Message::Binary(bytes) => self.handle(&bytes)?,
                Message::Pong(_) => deadline = Instant::now() + self.config.read_timeout,
                // The transport answers pings itself.
                Message::Ping(_) => {}
                Message::Close(_) => return Ok(()),
            }
        }
    }

    fn handle(&mut self, raw: &[u8]) -> Result<(), ConnectionError> {
        if raw.len() > self.config.max_frame_bytes {
            return Err(ConnectionError::FrameTooLarge(raw.len()));
        }
        let frame: ClientFrame = serde_json::from_slice(raw)?;
        let connection_id = self.subscriber.id();

        match frame.action {
            Action::Ping => {
                if self.control.try_send(Message::Pong(Bytes::new())).is_err() {
                    debug!(%connection_id, "pong dropped; writer is busy");
                }
            }
            _ if frame.event.is_empty() => {
                debug!(%connection_id, action = ?frame.action, "ignoring frame without event name");
            }
            Action::Subscribe => {
                self.bus.subscribe(&frame.event, &self.subscriber);
                self.events.insert(frame.event);
            }
            Action::Unsubscribe => {
                self.bus.unsubscribe(&frame.event, connection_id);
                self.events.remove(&frame.event);
            }
            Action::Emit => {
                self.bus
                    .dispatch_from_connection(&frame.event, &frame.payload);
            }
            Action::Unknown => {
                debug!(%connection_id, event = %frame.event, "ignoring frame with unknown action");
            }
        }
        Ok(())
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut queue: mpsc::Receiver<Arc<str>>,
    mut control: mpsc::Receiver<Message>,
    bus: Arc<EventBus>,
    subscriber: Arc<Subscriber>,
    config: ConnectionConfig,
) where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result: Result<(), ConnectionError> = loop {
        tokio::select! {
            () = subscriber.closed() => break Ok(()),
            next = queue.recv() => {
                let Some(text) = next else { break Ok(()) };
                if let Err(err) = sink.send(Message::Text(text.to_string().into())).await {
                    break Err(err.into());
                }
            }
            Some(frame) = control.recv() => {
                if let Err(err) = send_control(&mut sink, frame, config.write_timeout).await {
                    break Err(err);
                }
            }
            _ = heartbeat.tick() => {
                let ping = Message::Ping(Bytes::new());
                if let Err(err) = send_control(&mut sink, ping, config.write_timeout).await {
                    break Err(err);
                }
            }
        }
    };

    if let Err(err) = &result {
        debug!(connection_id = %subscriber.id(), %err, "write failed; closing connection");
    }
    bus.close(&subscriber);

    // Best effort: the peer may already be gone.
    let _ = send_control(&mut sink, Message::Close(None), config.write_timeout).await;
    let _ = timeout(config.write_timeout, sink.close()).await;
}

async fn send_control<W>(
    sink: &mut W,
    frame: Message,
    limit: Duration,
) -> Result<(), ConnectionError>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    match timeout(limit, sink.send(frame)).await {
        Ok(sent) => sent.map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}
