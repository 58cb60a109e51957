//! Event bus for connection and catalog notifications
//!
//! Uses tokio::sync::broadcast for pub/sub pattern.
//! Events are typed and can carry payloads.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::connection::{ConnectionState, HandshakeResult};
use crate::library::ListId;
use crate::protocol::ServerEvent;

/// Event types that can be published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // Connection lifecycle
    ConnectionStateChanged { state: ConnectionState },
    HandshakeCompleted { handshake: HandshakeResult },

    // Pushed by the server while listen mode is on
    ServerEvent { event: ServerEvent },

    // Catalog lists
    ListUpdated {
        list_id: ListId,
        total: usize,
        start: usize,
        count: usize,
    },
    ListCleared { list_id: ListId },
}

impl BusEvent {
    /// The connection state carried by this event, if any.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self {
            Self::ConnectionStateChanged { state } => Some(*state),
            _ => None,
        }
    }
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: BusEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("bus event dropped: no subscribers");
        }
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    /// Default capacity (256 events)
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

/// Create a new shared event bus
pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}
