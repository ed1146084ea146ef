//! The live event channel: a resilient bidirectional WebSocket client with
//! reconnection backoff, heartbeat liveness, a bounded priority queue, and
//! HTTP-fallback activation.
//!
//! The channel never surfaces transport errors to callers; failures become
//! state transitions plus events on the shared event bus.

#![allow(async_fn_in_trait)]

mod channel;
mod connector;
pub mod memory;
mod queue;
mod state;

pub use channel::{OutboundMessage, WebSocketManager};
pub use connector::{Connection, ConnectionReceiver, ConnectionSender, Connector, WsConnector};
pub use queue::{MessageQueue, QueuedMessage};
pub use state::{
    reconnect_delay, ConnectionMetrics, ConnectionState, ConnectionStatus, FallbackTransport,
};
