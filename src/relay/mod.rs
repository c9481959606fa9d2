//! Relay client
//!
//! Sits between the engines and the [`Transport`]. Outbound payloads are
//! encoded by the [`Codec`] and published; inbound messages are
//! deduplicated, decoded and fanned out: requests to every
//! [`Subscriber`], responses to whichever [`Relay::request`] call waits
//! for their id.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::{Codec, CodecError, InboundMessage};
use crate::crypto::KeyStore;
use crate::jsonrpc::{JsonRpcError, JsonRpcResponse, RpcResponse, WcRequest};
use crate::transport::{Transport, TransportError, TransportEvent};

pub mod subscriber;
pub use subscriber::Subscriber;

/// Relay client errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Publishing or (un)subscribing failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope could not be built
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer answered with an error response
    #[error("Peer rejected request: {0}")]
    Rejected(JsonRpcError),

    /// No response within the configured timeout
    #[error("Request timed out")]
    Timeout,

    /// The relay shut down before a response arrived
    #[error("Relay closed")]
    Closed,
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Relay client settings
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// How long [`Relay::request`] waits for a response; `None` waits forever
    pub request_timeout: Option<Duration>,
    /// Inbound messages remembered for deduplication
    pub history_capacity: usize,
    /// Buffer of the inbound request and connection broadcasts
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            request_timeout: None,
            history_capacity: 1024,
            channel_capacity: 256,
        }
    }
}

/// A decoded request received on a topic
#[derive(Clone, Debug, PartialEq)]
pub struct InboundRequest {
    /// Topic it arrived on
    pub topic: String,
    /// The request
    pub request: WcRequest,
}

/// Recently seen envelopes, oldest evicted first
struct History {
    seen: LruCache<String, ()>,
}

impl History {
    fn new(capacity: usize) -> Self {
        History {
            seen: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    fn contains(&self, message: &str) -> bool {
        self.seen.contains(message)
    }

    /// Returns false if `message` was already recorded
    fn insert(&mut self, message: &str) -> bool {
        if self.seen.contains(message) {
            return false;
        }
        self.seen.put(message.to_string(), ());
        true
    }
}

/// Relay client shared by the engines
pub struct Relay {
    transport: Arc<dyn Transport>,
    codec: Codec,
    config: RelayConfig,
    history: Mutex<History>,
    pending: Mutex<HashMap<i64, oneshot::Sender<RpcResponse>>>,
    requests: broadcast::Sender<InboundRequest>,
    connections: broadcast::Sender<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Relay {
    /// Create a relay client and start consuming `events`
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        key_store: Arc<dyn KeyStore>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let (requests, _) = broadcast::channel(config.channel_capacity);
        let (connections, _) = broadcast::channel(config.channel_capacity);

        let relay = Arc::new(Relay {
            transport,
            codec: Codec::new(key_store),
            history: Mutex::new(History::new(config.history_capacity)),
            pending: Mutex::new(HashMap::new()),
            config,
            requests,
            connections,
        });

        tokio::spawn(inbound_loop(Arc::downgrade(&relay), events));
        relay
    }

    /// Publish `request` on `topic` and wait for the response with its id
    pub async fn request(&self, topic: &str, request: &WcRequest) -> RelayResult<JsonRpcResponse> {
        let id = request.id;
        let message = self.codec.encode(topic, request)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        self.remember(&message);

        debug!(topic, id, method = %request.method(), "publishing request");
        if let Err(e) = self.transport.publish(topic, &message).await {
            self.cancel(id);
            return Err(e.into());
        }

        let response = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.cancel(id);
                    return Err(RelayError::Timeout);
                }
            },
            None => rx.await,
        };

        match response.map_err(|_| RelayError::Closed)? {
            RpcResponse::Success(response) => Ok(response),
            RpcResponse::Error(response) => Err(RelayError::Rejected(response.error)),
        }
    }

    /// Publish a response; nothing is awaited
    pub async fn respond(&self, topic: &str, response: RpcResponse) -> RelayResult<()> {
        let message = self.codec.encode(topic, &response)?;
        self.remember(&message);
        debug!(topic, id = response.id(), "publishing response");
        self.transport.publish(topic, &message).await?;
        Ok(())
    }

    /// Publish a request without waiting for its response
    pub async fn notify(&self, topic: &str, request: &WcRequest) -> RelayResult<()> {
        let message = self.codec.encode(topic, request)?;
        self.remember(&message);
        debug!(topic, id = request.id, method = %request.method(), "publishing notification");
        self.transport.publish(topic, &message).await?;
        Ok(())
    }

    /// Subscribe at the transport level
    pub async fn subscribe(&self, topic: &str) -> RelayResult<()> {
        self.transport.subscribe(topic).await?;
        Ok(())
    }

    /// Unsubscribe at the transport level
    pub async fn unsubscribe(&self, topic: &str) -> RelayResult<()> {
        self.transport.unsubscribe(topic).await?;
        Ok(())
    }

    /// Stream of every decoded inbound request
    pub fn subscribe_requests(&self) -> broadcast::Receiver<InboundRequest> {
        self.requests.subscribe()
    }

    /// Fires each time the transport (re)connects
    pub fn connection_events(&self) -> broadcast::Receiver<()> {
        self.connections.subscribe()
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    fn remember(&self, message: &str) {
        lock(&self.history).insert(message);
    }

    fn cancel(&self, id: i64) {
        lock(&self.pending).remove(&id);
    }

    fn resolve(&self, response: RpcResponse) {
        let id = response.id();
        match lock(&self.pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!(id, "response without pending request"),
        }
    }

    pub(crate) fn handle_message(&self, topic: &str, message: &str) {
        if lock(&self.history).contains(message) {
            debug!(topic, "duplicate message dropped");
            return;
        }

        let decoded = match self.codec.decode(topic, message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(topic, "undecodable message dropped: {}", e);
                return;
            }
        };
        if let InboundMessage::Unrecognized = decoded {
            debug!(topic, "unrecognized message dropped");
            return;
        }
        self.remember(message);

        match decoded {
            InboundMessage::Request(request) => {
                let inbound = InboundRequest {
                    topic: topic.to_string(),
                    request,
                };
                if self.requests.send(inbound).is_err() {
                    debug!(topic, "no request subscriber");
                }
            }
            InboundMessage::Response(response) => self.resolve(response.into()),
            InboundMessage::Error(response) => self.resolve(response.into()),
            InboundMessage::Unrecognized => {}
        }
    }
}

async fn inbound_loop(relay: Weak<Relay>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(relay) = relay.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Connected => {
                debug!("transport connected");
                let _ = relay.connections.send(());
            }
            TransportEvent::Message { topic, message } => relay.handle_message(&topic, &message),
        }
    }
    debug!("transport event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyExchange, MemoryKeyStore};
    use crate::jsonrpc::{JsonRpcErrorResponse, WcParams};
    use crate::transport::memory::MemoryRelay;
    use crate::types::PingParams;

    fn relay_on(hub: &MemoryRelay, config: RelayConfig) -> Arc<Relay> {
        let (transport, events) = hub.connect();
        Relay::new(
            Arc::new(transport),
            events,
            Arc::new(MemoryKeyStore::new()),
            config,
        )
    }

    fn ping() -> WcRequest {
        WcRequest::new(WcParams::SessionPing(PingParams {}))
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = History::new(2);
        assert!(history.insert("a"));
        assert!(history.insert("b"));
        assert!(!history.insert("a"));
        assert!(history.insert("c"));
        assert!(history.insert("a"));
    }

    #[tokio::test]
    async fn test_duplicate_dispatched_once() {
        let hub = MemoryRelay::new();
        let relay = relay_on(&hub, RelayConfig::default());
        let mut requests = relay.subscribe_requests();

        let message = serde_json::to_string(&ping()).unwrap();
        relay.handle_message("t", &message);
        relay.handle_message("t", &message);

        assert_eq!(requests.recv().await.unwrap().topic, "t");
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_redelivery_after_keys_arrive_is_dispatched() {
        let hub = MemoryRelay::new();
        let (transport, events) = hub.connect();
        let key_store = Arc::new(MemoryKeyStore::new());
        let relay = Relay::new(
            Arc::new(transport),
            events,
            key_store.clone(),
            RelayConfig::default(),
        );
        let mut requests = relay.subscribe_requests();

        let (alice, _) = KeyExchange::generate_key_pair();
        let (_, bob_pub) = KeyExchange::generate_key_pair();
        let keys = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();
        let sender_keys = Arc::new(MemoryKeyStore::new());
        sender_keys.set_agreement_keys("t", keys.clone()).unwrap();
        let sealed = Codec::new(sender_keys).encode("t", &ping()).unwrap();

        relay.handle_message("t", &sealed);
        assert!(requests.try_recv().is_err());

        key_store.set_agreement_keys("t", keys).unwrap();
        relay.handle_message("t", &sealed);
        assert_eq!(requests.recv().await.unwrap().topic, "t");
    }

    #[tokio::test]
    async fn test_own_messages_not_dispatched() {
        let hub = MemoryRelay::new();
        let relay = relay_on(&hub, RelayConfig::default());
        let mut requests = relay.subscribe_requests();

        let request = ping();
        relay.notify("t", &request).await.unwrap();
        relay.handle_message("t", &serde_json::to_string(&request).unwrap());

        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_resolved_by_matching_response() {
        let hub = MemoryRelay::new();
        let alice = relay_on(&hub, RelayConfig::default());
        let bob = relay_on(&hub, RelayConfig::default());
        alice.subscribe("t").await.unwrap();
        bob.subscribe("t").await.unwrap();

        let mut inbound = bob.subscribe_requests();
        let responder = tokio::spawn(async move {
            let request = inbound.recv().await.unwrap();
            bob.respond(&request.topic, JsonRpcResponse::ack(request.request.id).into())
                .await
                .unwrap();
        });

        let response = alice.request("t", &ping()).await.unwrap();
        assert_eq!(response.result, serde_json::Value::Bool(true));
        assert_eq!(alice.pending_requests(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let hub = MemoryRelay::new();
        let alice = relay_on(&hub, RelayConfig::default());
        let bob = relay_on(&hub, RelayConfig::default());
        alice.subscribe("t").await.unwrap();
        bob.subscribe("t").await.unwrap();

        let mut inbound = bob.subscribe_requests();
        tokio::spawn(async move {
            let request = inbound.recv().await.unwrap();
            let error = JsonRpcErrorResponse::new(request.request.id, 3001, "nope");
            bob.respond(&request.topic, error.into()).await.unwrap();
        });

        match alice.request("t", &ping()).await {
            Err(RelayError::Rejected(error)) => assert_eq!(error.code, 3001),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let hub = MemoryRelay::new();
        let config = RelayConfig {
            request_timeout: Some(Duration::from_millis(50)),
            ..RelayConfig::default()
        };
        let relay = relay_on(&hub, config);

        assert!(matches!(
            relay.request("silent", &ping()).await,
            Err(RelayError::Timeout)
        ));
        assert_eq!(relay.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_connection_events_forwarded() {
        let hub = MemoryRelay::new();
        let relay = relay_on(&hub, RelayConfig::default());
        let mut connections = relay.connection_events();

        hub.simulate_reconnect();
        tokio::time::timeout(Duration::from_secs(1), connections.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
