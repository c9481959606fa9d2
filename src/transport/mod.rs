//! Transport layer abstraction
//!
//! A transport moves opaque strings between this process and a topic-keyed
//! store-and-forward relay:
//! - In-memory hub (for testing)
//! - WebSocket connection to the bundled relay server
//!
//! # Design
//!
//! The transport does not decode or deduplicate anything. Inbound traffic
//! and connection changes arrive on the event channel handed out when the
//! transport is created; encryption is handled by the codec above it.

use async_trait::async_trait;
use thiserror::Error;

pub mod websocket;
pub use websocket::WebSocketTransport;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Something the relay told us
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection (re)established; server-side subscriptions may be gone
    Connected,
    /// A message published on a topic we subscribe to
    Message {
        /// Topic it was published on
        topic: String,
        /// Opaque envelope
        message: String,
    },
}

/// Abstract topic transport
///
/// Implementations make no delivery guarantees; the same message may
/// arrive more than once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `message` on `topic`
    async fn publish(&self, topic: &str, message: &str) -> TransportResult<()>;

    /// Start receiving messages for `topic`
    async fn subscribe(&self, topic: &str) -> TransportResult<()>;

    /// Stop receiving messages for `topic`
    async fn unsubscribe(&self, topic: &str) -> TransportResult<()>;
}

/// In-memory relay for testing
///
/// One [`MemoryRelay`] plays the relay server; every [`MemoryTransport`]
/// connected to it is a client.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::mpsc;
    use tracing::debug;

    struct Connection {
        events: mpsc::UnboundedSender<TransportEvent>,
        topics: HashSet<String>,
    }

    #[derive(Default)]
    struct Hub {
        next_id: u64,
        connections: HashMap<u64, Connection>,
        /// Messages published while nobody else listened: (publisher, message)
        mailbox: HashMap<String, Vec<(u64, String)>>,
    }

    /// In-process store-and-forward relay
    #[derive(Clone, Default)]
    pub struct MemoryRelay {
        hub: Arc<Mutex<Hub>>,
    }

    impl MemoryRelay {
        /// Create an empty relay
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> TransportResult<MutexGuard<'_, Hub>> {
            self.hub.lock().map_err(|_| TransportError::Disconnected)
        }

        /// Connect a new client
        pub fn connect(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(TransportEvent::Connected);

            let id = match self.hub.lock() {
                Ok(mut hub) => {
                    hub.next_id += 1;
                    let id = hub.next_id;
                    hub.connections.insert(
                        id,
                        Connection {
                            events: tx,
                            topics: HashSet::new(),
                        },
                    );
                    id
                }
                Err(_) => 0,
            };

            let transport = MemoryTransport {
                id,
                relay: self.clone(),
            };
            (transport, rx)
        }

        /// Drop every server-side subscription and announce a fresh connection
        pub fn simulate_reconnect(&self) {
            if let Ok(mut hub) = self.hub.lock() {
                for connection in hub.connections.values_mut() {
                    connection.topics.clear();
                    let _ = connection.events.send(TransportEvent::Connected);
                }
            }
        }

        /// Number of clients subscribed to `topic`
        pub fn subscriber_count(&self, topic: &str) -> usize {
            self.hub
                .lock()
                .map(|hub| {
                    hub.connections
                        .values()
                        .filter(|c| c.topics.contains(topic))
                        .count()
                })
                .unwrap_or(0)
        }
    }

    /// Client endpoint of a [`MemoryRelay`]
    pub struct MemoryTransport {
        id: u64,
        relay: MemoryRelay,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn publish(&self, topic: &str, message: &str) -> TransportResult<()> {
            let mut hub = self.relay.lock()?;
            if !hub.connections.contains_key(&self.id) {
                return Err(TransportError::Disconnected);
            }

            let mut delivered = false;
            for (id, connection) in hub.connections.iter() {
                if *id != self.id && connection.topics.contains(topic) {
                    let _ = connection.events.send(TransportEvent::Message {
                        topic: topic.to_string(),
                        message: message.to_string(),
                    });
                    delivered = true;
                }
            }

            if !delivered {
                debug!(topic, "no subscriber, holding message");
                hub.mailbox
                    .entry(topic.to_string())
                    .or_default()
                    .push((self.id, message.to_string()));
            }
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> TransportResult<()> {
            let mut hub = self.relay.lock()?;
            let held = hub.mailbox.remove(topic).unwrap_or_default();
            let connection = hub
                .connections
                .get_mut(&self.id)
                .ok_or(TransportError::Disconnected)?;
            connection.topics.insert(topic.to_string());

            let mut kept = Vec::new();
            for (publisher, message) in held {
                if publisher == self.id {
                    kept.push((publisher, message));
                } else {
                    let _ = connection.events.send(TransportEvent::Message {
                        topic: topic.to_string(),
                        message,
                    });
                }
            }
            if !kept.is_empty() {
                hub.mailbox.insert(topic.to_string(), kept);
            }
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
            let mut hub = self.relay.lock()?;
            if let Some(connection) = hub.connections.get_mut(&self.id) {
                connection.topics.remove(topic);
            }
            Ok(())
        }
    }

    impl Drop for MemoryTransport {
        fn drop(&mut self) {
            if let Ok(mut hub) = self.relay.hub.lock() {
                hub.connections.remove(&self.id);
            }
        }
    }
}
