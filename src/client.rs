//! Client facade
//!
//! Wires one relay and both engines together and folds their events into a
//! single [`ClientEvent`] stream.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::KeyStore;
use crate::engine::{PairingEngine, PairingEvent, SessionEngine, SessionEvent};
use crate::error::{Error, Result};
use crate::jsonrpc::{JsonRpcResponse, RpcResponse};
use crate::relay::{Relay, RelayConfig};
use crate::store::{KeyValueStore, SequenceStore};
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    AppMetadata, Pairing, PairingUri, PayloadRequestParams, Reason, RelayProtocolOptions, Session,
    SessionPermissions, SessionProposal, SessionRequest,
};

const PAIRING_NAMESPACE: &str = "pairing:";
const SESSION_NAMESPACE: &str = "session:";

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Metadata shown to peers
    pub metadata: AppMetadata,
    /// Whether this side controls the sequences it takes part in
    pub is_controller: bool,
    /// Relay client settings
    pub relay: RelayConfig,
}

impl ClientConfig {
    /// Config with default relay settings
    pub fn new(metadata: AppMetadata, is_controller: bool) -> Self {
        ClientConfig {
            metadata,
            is_controller,
            relay: RelayConfig::default(),
        }
    }
}

/// Everything the application is told about
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// A pairing settled
    PairingSettled(Pairing),
    /// The peer deleted a pairing
    PairingDeleted {
        /// Pairing topic
        topic: String,
        /// Peer's reason
        reason: Reason,
    },
    /// The peer proposed a session; answer with approve or reject
    SessionProposal(SessionProposal),
    /// A session settled
    SessionSettled(Session),
    /// Our session proposal was declined
    SessionRejected {
        /// Proposal topic
        pending_topic: String,
        /// Responder's reason
        reason: Reason,
    },
    /// The peer called a method; answer with [`Client::respond`]
    SessionRequest(SessionRequest),
    /// The peer deleted a session
    SessionDeleted {
        /// Session topic
        topic: String,
        /// Peer's reason
        reason: Reason,
    },
    /// Session permissions were widened
    SessionUpgraded {
        /// Session topic
        topic: String,
        /// Permissions after the upgrade
        permissions: SessionPermissions,
    },
    /// Session accounts were added
    SessionUpdated {
        /// Session topic
        topic: String,
        /// Accounts after the update
        accounts: BTreeSet<String>,
    },
    /// The session queued by [`Client::connect`] could not be proposed
    /// once its pairing settled
    SessionProposalFailed {
        /// Settled pairing topic
        pairing_topic: String,
        /// What went wrong
        error: String,
    },
    /// A pairing, or a pairing proposal nobody answered, expired
    PairingExpired {
        /// Pairing or proposal topic
        topic: String,
    },
    /// A session, or a session proposal nobody answered, expired
    SessionExpired {
        /// Session or proposal topic
        topic: String,
    },
}

/// Pairing and session client
pub struct Client {
    relay: Arc<Relay>,
    pairing: Arc<PairingEngine>,
    session: Arc<SessionEngine>,
    /// Session permissions waiting for their pairing, by proposal topic
    pending_permissions: Mutex<HashMap<String, SessionPermissions>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    /// Build a client over `transport`. Must be called inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        key_store: Arc<dyn KeyStore>,
        storage: Arc<dyn KeyValueStore>,
    ) -> (Arc<Client>, mpsc::UnboundedReceiver<ClientEvent>) {
        let relay = Relay::new(transport, transport_events, key_store.clone(), config.relay);

        let (pairing_tx, pairing_rx) = mpsc::unbounded_channel();
        let pairing = PairingEngine::new(
            relay.clone(),
            key_store.clone(),
            SequenceStore::new(storage.clone(), PAIRING_NAMESPACE),
            config.is_controller,
            config.metadata.clone(),
            pairing_tx,
        );

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let session = SessionEngine::new(
            relay.clone(),
            key_store,
            SequenceStore::new(storage, SESSION_NAMESPACE),
            config.is_controller,
            config.metadata,
            session_tx,
        );

        let (events, client_events) = mpsc::unbounded_channel();
        let client = Arc::new(Client {
            relay,
            pairing,
            session,
            pending_permissions: Mutex::new(HashMap::new()),
            events,
        });

        tokio::spawn(fold_pairing_events(Arc::downgrade(&client), pairing_rx));
        tokio::spawn(fold_session_events(Arc::downgrade(&client), session_rx));
        (client, client_events)
    }

    /// Start a session.
    ///
    /// With `pairing_topic` the session is proposed over that settled
    /// pairing and `None` is returned. Otherwise a new pairing is proposed
    /// and its URI returned; the session follows once the pairing settles.
    pub async fn connect(
        &self,
        permissions: SessionPermissions,
        pairing_topic: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(topic) = pairing_topic {
            let relay = self
                .pairing
                .get(topic)?
                .filter(|sequence| sequence.is_settled())
                .map(|sequence| sequence.relay)
                .ok_or_else(|| Error::not_found(topic))?;
            self.session.propose_session(topic, permissions, relay).await?;
            return Ok(None);
        }

        let proposal = self.pairing.propose().await?;
        self.lock_pending().insert(proposal.topic.clone(), permissions);
        Ok(Some(proposal.uri().to_string()))
    }

    /// Pair with the proposer of `uri`
    pub async fn pair(&self, uri: &str) -> Result<Pairing> {
        let uri: PairingUri = uri.parse()?;
        let pairing = self.pairing.pair(&uri).await?;
        self.emit(ClientEvent::PairingSettled(pairing.clone()));
        Ok(pairing)
    }

    /// Approve a proposed session with `accounts`
    pub async fn approve(
        &self,
        proposal: &SessionProposal,
        accounts: BTreeSet<String>,
    ) -> Result<Session> {
        self.session.approve(proposal, accounts).await
    }

    /// Decline a proposed session
    pub async fn reject(&self, proposal: &SessionProposal, reason: Reason) -> Result<()> {
        self.session.reject(proposal, reason).await
    }

    /// Add accounts to a session we control
    pub async fn update(&self, topic: &str, accounts: BTreeSet<String>) -> Result<BTreeSet<String>> {
        self.session.update(topic, accounts).await
    }

    /// Widen the permissions of a session we control
    pub async fn upgrade(
        &self,
        topic: &str,
        permissions: SessionPermissions,
    ) -> Result<SessionPermissions> {
        self.session.upgrade(topic, permissions).await
    }

    /// Ping the peer of a pairing or session
    pub async fn ping(&self, topic: &str) -> Result<()> {
        if self.session.get(topic)?.is_some() {
            self.session.ping(topic).await
        } else {
            self.pairing.ping(topic).await
        }
    }

    /// Delete a pairing or session and tell the peer
    pub async fn disconnect(&self, topic: &str, reason: Reason) -> Result<()> {
        if self.session.get(topic)?.is_some() {
            self.session.delete(topic, reason).await
        } else {
            self.pairing.delete(topic, reason).await
        }
    }

    /// Call a method on the peer of a session
    pub async fn request(&self, params: PayloadRequestParams) -> Result<JsonRpcResponse> {
        self.session.request(params).await
    }

    /// Answer a [`ClientEvent::SessionRequest`]
    pub async fn respond(&self, topic: &str, response: RpcResponse) -> Result<()> {
        self.session.respond(topic, response).await
    }

    /// Every settled session
    pub fn settled_sessions(&self) -> Result<Vec<Session>> {
        self.session.settled_sessions()
    }

    /// Every settled pairing
    pub fn settled_pairings(&self) -> Result<Vec<Pairing>> {
        self.pairing.settled_pairings()
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.relay.pending_requests()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionPermissions>> {
        self.pending_permissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("client event dropped, no listener");
        }
    }

    fn on_pairing_approved(
        self: &Arc<Self>,
        pairing: Pairing,
        pending_topic: &str,
        relay: RelayProtocolOptions,
    ) {
        let topic = pairing.topic.clone();
        self.emit(ClientEvent::PairingSettled(pairing));

        let Some(permissions) = self.lock_pending().remove(pending_topic) else {
            debug!(topic = %topic, "pairing settled without a queued session");
            return;
        };
        let client = self.clone();
        tokio::spawn(async move {
            match client.session.propose_session(&topic, permissions, relay).await {
                Ok(proposal) => info!(topic = %proposal.topic, "session proposal sent"),
                Err(e) => {
                    warn!(pairing = %topic, "session proposal failed: {}", e);
                    client.emit(ClientEvent::SessionProposalFailed {
                        pairing_topic: topic,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    fn on_pairing_expired(&self, topic: String) {
        if self.lock_pending().remove(&topic).is_some() {
            debug!(topic = %topic, "dropped session queued on expired proposal");
        }
        self.emit(ClientEvent::PairingExpired { topic });
    }
}

async fn fold_pairing_events(client: Weak<Client>, mut events: mpsc::UnboundedReceiver<PairingEvent>) {
    while let Some(event) = events.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        match event {
            PairingEvent::Approved {
                pairing,
                pending_topic,
                relay,
            } => client.on_pairing_approved(pairing, &pending_topic, relay),
            PairingEvent::SessionProposal(proposal) => {
                client.emit(ClientEvent::SessionProposal(proposal))
            }
            PairingEvent::Deleted { topic, reason } => {
                client.emit(ClientEvent::PairingDeleted { topic, reason })
            }
            PairingEvent::Expired { topic } => client.on_pairing_expired(topic),
        }
    }
}

async fn fold_session_events(client: Weak<Client>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        client.emit(match event {
            SessionEvent::Approved(session) => ClientEvent::SessionSettled(session),
            SessionEvent::Rejected {
                pending_topic,
                reason,
            } => ClientEvent::SessionRejected {
                pending_topic,
                reason,
            },
            SessionEvent::PayloadRequest(request) => ClientEvent::SessionRequest(request),
            SessionEvent::Deleted { topic, reason } => ClientEvent::SessionDeleted { topic, reason },
            SessionEvent::Upgraded { topic, permissions } => {
                ClientEvent::SessionUpgraded { topic, permissions }
            }
            SessionEvent::Updated { topic, accounts } => {
                ClientEvent::SessionUpdated { topic, accounts }
            }
            SessionEvent::Expired { topic } => ClientEvent::SessionExpired { topic },
        });
    }
}
