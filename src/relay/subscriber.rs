//! Topic ownership
//!
//! Several engines share one [`Relay`]; each owns a set of topics through
//! its own [`Subscriber`] and only sees inbound requests for those topics.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use super::{InboundRequest, Relay, RelayResult};

/// Set of topics owned by one engine
pub struct Subscriber {
    relay: Arc<Relay>,
    topics: RwLock<HashSet<String>>,
}

impl Subscriber {
    /// Create a subscriber and the stream of requests for its topics
    pub fn new(relay: Arc<Relay>) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>) {
        let inbound = relay.subscribe_requests();
        let subscriber = Arc::new(Subscriber {
            relay,
            topics: RwLock::new(HashSet::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(filter_loop(Arc::downgrade(&subscriber), inbound, tx));
        (subscriber, rx)
    }

    /// Take ownership of `topic` and subscribe at the transport
    pub async fn add_subscription(&self, topic: &str) -> RelayResult<()> {
        self.topics.write().await.insert(topic.to_string());
        if let Err(e) = self.relay.subscribe(topic).await {
            self.topics.write().await.remove(topic);
            return Err(e);
        }
        Ok(())
    }

    /// Release `topic` and unsubscribe at the transport
    pub async fn remove_subscription(&self, topic: &str) -> RelayResult<()> {
        self.topics.write().await.remove(topic);
        self.relay.unsubscribe(topic).await
    }

    /// Whether `topic` is owned
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().await.contains(topic)
    }

    /// Snapshot of owned topics
    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.iter().cloned().collect()
    }
}

async fn filter_loop(
    subscriber: Weak<Subscriber>,
    mut inbound: broadcast::Receiver<InboundRequest>,
    forward: mpsc::UnboundedSender<InboundRequest>,
) {
    loop {
        let request = match inbound.recv().await {
            Ok(request) => request,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber fell behind, requests lost");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(subscriber) = subscriber.upgrade() else {
            break;
        };
        if !subscriber.is_subscribed(&request.topic).await {
            continue;
        }
        if forward.send(request).is_err() {
            break;
        }
    }
    debug!("subscriber stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MemoryKeyStore;
    use crate::jsonrpc::{WcParams, WcRequest};
    use crate::relay::RelayConfig;
    use crate::transport::memory::MemoryRelay;
    use crate::types::PingParams;
    use std::time::Duration;

    #[tokio::test]
    async fn test_only_owned_topics_forwarded() {
        let hub = MemoryRelay::new();
        let (transport, events) = hub.connect();
        let relay = Relay::new(
            Arc::new(transport),
            events,
            Arc::new(MemoryKeyStore::new()),
            RelayConfig::default(),
        );
        let (subscriber, mut requests) = Subscriber::new(relay.clone());

        subscriber.add_subscription("mine").await.unwrap();
        assert!(subscriber.is_subscribed("mine").await);
        assert_eq!(hub.subscriber_count("mine"), 1);

        let ping = |id| {
            let mut request = WcRequest::new(WcParams::PairingPing(PingParams {}));
            request.id = id;
            serde_json::to_string(&request).unwrap()
        };
        relay.handle_message("other", &ping(1));
        relay.handle_message("mine", &ping(2));

        let received = tokio::time::timeout(Duration::from_secs(1), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.topic, "mine");
        assert_eq!(received.request.id, 2);

        subscriber.remove_subscription("mine").await.unwrap();
        assert!(subscriber.topics().await.is_empty());
        assert_eq!(hub.subscriber_count("mine"), 0);
    }
}
