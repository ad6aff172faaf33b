//! Named-event fan-out between the bridge and its browser clients.
//!
//! Clients connect over WebSocket and send [`ClientFrame`]s to subscribe to,
//! unsubscribe from, or emit named events. The server pushes [`EventFrame`]s
//! to every connection subscribed to an event.
//!
//! # Architecture
//!
//! ```text
//! browser  <--WS-->  Connection  <-->  EventBus  <-->  server-side handlers
//!                     (reader +         (subscriber
//!                      writer)           sets, handlers)
//! ```
//!
//! Each [`Connection`] owns a bounded outbound queue. [`EventBus::emit`]
//! serializes a frame once and hands it to every subscriber's queue, waiting
//! when a queue is full. [`ClientMultiplexer`] is the same protocol seen
//! from the other end: one socket shared by many local listeners, reopened
//! and resubscribed whenever it drops.

mod bus;
mod client;
mod connection;
mod protocol;

pub use bus::{ConnectionId, EventBus, Handler, HandlerGuard, HandlerId, Subscriber, QUEUE_CAPACITY};
pub use client::{ClientConfig, ClientError, ClientHandler, ClientMultiplexer, ListenerId};
pub use connection::{Connection, ConnectionConfig, ConnectionError, MAX_FRAME_BYTES};
pub use protocol::{Action, ClientFrame, EventFrame};
