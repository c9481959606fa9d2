//! Session engine
//!
//! Sessions are proposed over a settled pairing, approved or rejected by the
//! responder, and then carry application calls. Only the controller may
//! widen permissions (upgrade) or add accounts (update); the other side
//! checks this before applying either.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{acknowledge, refuse, spawn_loops, Engine};
use crate::crypto::{generate_topic, KeyExchange, KeyStore, PrivateKey};
use crate::error::{Error, Result};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RpcResponse, WcMethod, WcParams, WcRequest};
use crate::relay::{InboundRequest, Relay, Subscriber};
use crate::store::{Pending, PendingStatus, SequenceState, SequenceStore, PENDING_TTL};
use crate::types::{
    AppMetadata, Controller, DeleteParams, PairingPayloadParams, PairingPayloadRequest,
    Participant, PayloadRequestParams, PingParams, Reason, RelayProtocolOptions, Session,
    SessionApproveParams, SessionPayloadParams, SessionPayloadRequest, SessionPermissions,
    SessionProposal, SessionProposer, SessionRejectParams, SessionRequest, SessionSequence,
    SessionSettled, SessionSignal, SessionState, SessionUpdateParams, SessionUpgradeParams,
    SESSION_DEFAULT_TTL,
};

/// Things the session engine reports
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A session settled, on either side
    Approved(Session),
    /// The responder declined our proposal
    Rejected {
        /// Proposal topic
        pending_topic: String,
        /// Responder's reason
        reason: Reason,
    },
    /// The peer called a method over a session
    PayloadRequest(SessionRequest),
    /// The peer deleted a session
    Deleted {
        /// Session topic
        topic: String,
        /// Peer's reason
        reason: Reason,
    },
    /// Permissions were widened
    Upgraded {
        /// Session topic
        topic: String,
        /// Permissions after the upgrade
        permissions: SessionPermissions,
    },
    /// Accounts were added
    Updated {
        /// Session topic
        topic: String,
        /// Accounts after the update
        accounts: BTreeSet<String>,
    },
    /// A session or proposal outlived its expiry and was released
    Expired {
        /// Session or proposal topic
        topic: String,
    },
}

/// Session state machine
pub struct SessionEngine {
    relay: Arc<Relay>,
    subscriber: Arc<Subscriber>,
    key_store: Arc<dyn KeyStore>,
    store: SequenceStore<SessionSequence>,
    is_controller: bool,
    metadata: AppMetadata,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEngine {
    /// Create the engine and start handling requests on its topics
    pub fn new(
        relay: Arc<Relay>,
        key_store: Arc<dyn KeyStore>,
        store: SequenceStore<SessionSequence>,
        is_controller: bool,
        metadata: AppMetadata,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let connections = relay.connection_events();
        let (subscriber, requests) = Subscriber::new(relay.clone());
        let engine = Arc::new(SessionEngine {
            relay,
            subscriber,
            key_store,
            store,
            is_controller,
            metadata,
            events,
        });
        spawn_loops(&engine, requests, connections);
        engine
    }

    /// Propose a session to the peer of a settled pairing
    pub async fn propose_session(
        &self,
        pairing_topic: &str,
        permissions: SessionPermissions,
        relay: RelayProtocolOptions,
    ) -> Result<SessionProposal> {
        let pairing_keys =
            self.key_store
                .agreement_keys(pairing_topic)?
                .ok_or_else(|| Error::NoAgreementKeys {
                    topic: pairing_topic.to_string(),
                })?;

        let (private_key, public_key) = KeyExchange::generate_key_pair();
        let public_key = public_key.to_hex();
        self.key_store.set_private_key(private_key)?;

        let proposal = SessionProposal {
            topic: generate_topic(),
            relay: relay.clone(),
            proposer: SessionProposer {
                public_key: public_key.clone(),
                controller: self.is_controller,
                metadata: Some(self.metadata.clone()),
            },
            signal: SessionSignal::pairing(pairing_topic),
            permissions,
            ttl: SESSION_DEFAULT_TTL,
        };
        let topic = proposal.topic.clone();

        self.key_store.set_agreement_keys(&topic, pairing_keys)?;
        let sequence = SessionSequence {
            topic: topic.clone(),
            relay,
            self_participant: Participant::new(public_key, Some(self.metadata.clone())),
            expiry: self.store.now() + PENDING_TTL,
            state: SequenceState::Pending(Pending {
                proposal: proposal.clone(),
                status: PendingStatus::Proposed,
            }),
        };
        self.store.set(&topic, &sequence)?;
        self.subscriber.add_subscription(&topic).await?;

        let request = WcRequest::new(WcParams::PairingPayload(PairingPayloadParams {
            request: PairingPayloadRequest {
                method: WcMethod::SessionPropose.as_str().to_string(),
                params: proposal.clone(),
            },
        }));
        self.relay.request(pairing_topic, &request).await?;

        info!(topic = %topic, pairing = pairing_topic, "session proposed");
        Ok(proposal)
    }

    /// Accept a proposal and settle the session with `accounts`
    pub async fn approve(
        &self,
        proposal: &SessionProposal,
        accounts: BTreeSet<String>,
    ) -> Result<Session> {
        if proposal.proposer.controller == self.is_controller {
            return Err(Error::UnauthorizedMatchingController);
        }

        let private_key = PrivateKey::generate();
        let self_public_key = private_key.public_key().to_hex();
        let keys = KeyExchange::agree(&proposal.proposer.public_key, &private_key)?;
        let settled_topic = keys.derive_topic();
        let self_participant = Participant::new(self_public_key.clone(), Some(self.metadata.clone()));
        let now = self.store.now();

        let pending = SessionSequence {
            topic: proposal.topic.clone(),
            relay: proposal.relay.clone(),
            self_participant: self_participant.clone(),
            expiry: now + PENDING_TTL,
            state: SequenceState::Pending(Pending {
                proposal: proposal.clone(),
                status: PendingStatus::Responded,
            }),
        };
        self.store.set(&proposal.topic, &pending)?;

        let controller = if proposal.proposer.controller {
            proposal.proposer.public_key.clone()
        } else {
            self_public_key.clone()
        };
        let expiry = now + proposal.ttl;
        let state = SessionState { accounts };
        let settled = SessionSettled {
            peer: Participant::new(
                proposal.proposer.public_key.clone(),
                proposal.proposer.metadata.clone(),
            ),
            permissions: proposal.permissions.clone(),
            controller: Controller {
                public_key: controller,
            },
            state: state.clone(),
        };
        let session = Session::from_settled(&settled_topic, &settled);
        let sequence = SessionSequence {
            topic: settled_topic.clone(),
            relay: proposal.relay.clone(),
            self_participant: self_participant.clone(),
            expiry,
            state: SequenceState::Settled(settled),
        };
        self.store
            .update(&proposal.topic, Some(&settled_topic), &sequence)?;
        self.key_store.set_agreement_keys(&settled_topic, keys)?;
        self.key_store.set_private_key(private_key)?;

        let approve = WcRequest::new(WcParams::SessionApprove(SessionApproveParams {
            relay: proposal.relay.clone(),
            responder: self_participant,
            expiry,
            state,
        }));
        let result = self.send_on_proposal_topic(proposal, &approve, &settled_topic).await;
        if let Err(e) = result {
            warn!(topic = %settled_topic, "session approval failed: {}", e);
            self.rollback_approve(&settled_topic, &self_public_key).await;
            return Err(e);
        }

        info!(topic = %settled_topic, "session settled");
        self.emit(SessionEvent::Approved(session.clone()));
        Ok(session)
    }

    async fn rollback_approve(&self, settled_topic: &str, self_public_key: &str) {
        debug!(topic = settled_topic, "rolling back failed approval");
        if let Err(e) = self.store.delete(settled_topic) {
            warn!("rollback: {}", e);
        }
        if let Err(e) = self.key_store.delete_agreement_keys(settled_topic) {
            warn!("rollback: {}", e);
        }
        if let Err(e) = self.key_store.delete_private_key(self_public_key) {
            warn!("rollback: {}", e);
        }
        if let Err(e) = self.subscriber.remove_subscription(settled_topic).await {
            warn!("rollback: {}", e);
        }
    }

    /// Decline a proposal; nothing is persisted
    pub async fn reject(&self, proposal: &SessionProposal, reason: Reason) -> Result<()> {
        let request = WcRequest::new(WcParams::SessionReject(SessionRejectParams { reason }));
        self.subscriber.add_subscription(&proposal.topic).await?;
        let sent = self.relay.request(&proposal.topic, &request).await;
        self.leave_proposal_topic(&proposal.topic).await;
        sent?;
        info!(topic = %proposal.topic, "session proposal rejected");
        Ok(())
    }

    /// Subscribe the settled topic, then publish on the proposal topic
    async fn send_on_proposal_topic(
        &self,
        proposal: &SessionProposal,
        request: &WcRequest,
        settled_topic: &str,
    ) -> Result<()> {
        self.subscriber.add_subscription(settled_topic).await?;
        self.subscriber.add_subscription(&proposal.topic).await?;
        let sent = self.relay.request(&proposal.topic, request).await;
        self.leave_proposal_topic(&proposal.topic).await;
        sent?;
        Ok(())
    }

    async fn leave_proposal_topic(&self, topic: &str) {
        if let Err(e) = self.subscriber.remove_subscription(topic).await {
            debug!(topic, "failed to leave proposal topic: {}", e);
        }
        if let Err(e) = self.key_store.delete_agreement_keys(topic) {
            debug!(topic, "failed to drop proposal keys: {}", e);
        }
    }

    /// Widen the permissions of a session we control
    pub async fn upgrade(
        &self,
        topic: &str,
        permissions: SessionPermissions,
    ) -> Result<SessionPermissions> {
        self.controlled_session(topic, Error::UnauthorizedUpgradeRequest)?;
        let request = WcRequest::new(WcParams::SessionUpgrade(SessionUpgradeParams {
            permissions: permissions.clone(),
        }));
        self.relay.request(topic, &request).await?;

        let upgraded = self.modify_settled(topic, |settled| {
            settled.permissions = settled.permissions.union(&permissions);
            settled.permissions.clone()
        })?;
        info!(topic, "session upgraded");
        self.emit(SessionEvent::Upgraded {
            topic: topic.to_string(),
            permissions: upgraded.clone(),
        });
        Ok(upgraded)
    }

    /// Add accounts to a session we control
    pub async fn update(&self, topic: &str, accounts: BTreeSet<String>) -> Result<BTreeSet<String>> {
        self.controlled_session(topic, Error::UnauthorizedUpdateRequest)?;
        let request = WcRequest::new(WcParams::SessionUpdate(SessionUpdateParams {
            state: SessionState {
                accounts: accounts.clone(),
            },
        }));
        self.relay.request(topic, &request).await?;

        let updated = self.modify_settled(topic, |settled| {
            settled.state.accounts.extend(accounts);
            settled.state.accounts.clone()
        })?;
        info!(topic, "session updated");
        self.emit(SessionEvent::Updated {
            topic: topic.to_string(),
            accounts: updated.clone(),
        });
        Ok(updated)
    }

    /// Call a method on the peer over a session
    pub async fn request(&self, params: PayloadRequestParams) -> Result<JsonRpcResponse> {
        self.settled(&params.topic)?;
        let request = WcRequest::new(WcParams::SessionPayload(SessionPayloadParams {
            request: SessionPayloadRequest {
                method: params.method,
                params: params.params,
            },
            chain_id: params.chain_id,
        }));
        Ok(self.relay.request(&params.topic, &request).await?)
    }

    /// Answer a [`SessionEvent::PayloadRequest`]
    pub async fn respond(&self, topic: &str, response: RpcResponse) -> Result<()> {
        self.settled(topic)?;
        self.relay.respond(topic, response).await?;
        Ok(())
    }

    /// Check that the peer of a session is reachable
    pub async fn ping(&self, topic: &str) -> Result<()> {
        if self.store.get(topic)?.is_none() {
            return Err(Error::not_found(topic));
        }
        let request = WcRequest::new(WcParams::SessionPing(PingParams {}));
        self.relay.request(topic, &request).await?;
        debug!(topic, "session ping answered");
        Ok(())
    }

    /// Tell the peer, without waiting, and drop the session locally
    pub async fn delete(&self, topic: &str, reason: Reason) -> Result<()> {
        if self.store.get(topic)?.is_none() {
            return Err(Error::not_found(topic));
        }
        let request = WcRequest::new(WcParams::SessionDelete(DeleteParams { reason }));
        let published = self.relay.notify(topic, &request).await;
        self.forget(topic).await?;
        published?;
        info!(topic, "session deleted");
        Ok(())
    }

    /// Stored session for `topic`, pending or settled
    pub fn get(&self, topic: &str) -> Result<Option<SessionSequence>> {
        Ok(self.store.get(topic)?)
    }

    /// Every settled session
    pub fn settled_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .store
            .get_all()?
            .iter()
            .filter_map(|sequence| {
                sequence
                    .settled()
                    .map(|settled| Session::from_settled(&sequence.topic, settled))
            })
            .collect())
    }

    /// Release every expired session and report it; returns their topics
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let mut topics = Vec::new();
        for sequence in self.store.take_expired()? {
            let topic = sequence.topic;
            if let Err(e) = self.subscriber.remove_subscription(&topic).await {
                warn!(topic = %topic, "failed to leave expired session: {}", e);
            }
            if let Err(e) = self.key_store.delete_agreement_keys(&topic) {
                warn!(topic = %topic, "failed to drop expired session keys: {}", e);
            }
            if let Err(e) = self
                .key_store
                .delete_private_key(&sequence.self_participant.public_key)
            {
                warn!(topic = %topic, "failed to drop expired session key: {}", e);
            }
            info!(topic = %topic, "session expired");
            self.emit(SessionEvent::Expired {
                topic: topic.clone(),
            });
            topics.push(topic);
        }
        Ok(topics)
    }

    fn settled(&self, topic: &str) -> Result<(SessionSequence, SessionSettled)> {
        let sequence = self.store.get(topic)?.ok_or_else(|| Error::not_found(topic))?;
        let settled = sequence
            .settled()
            .cloned()
            .ok_or_else(|| Error::not_found(topic))?;
        Ok((sequence, settled))
    }

    fn controlled_session(&self, topic: &str, unauthorized: Error) -> Result<()> {
        let (sequence, settled) = self.settled(topic)?;
        if settled.controller.public_key != sequence.self_participant.public_key {
            return Err(unauthorized);
        }
        Ok(())
    }

    fn modify_settled<R>(&self, topic: &str, change: impl FnOnce(&mut SessionSettled) -> R) -> Result<R> {
        let changed = self.store.modify(topic, |sequence| match &mut sequence.state {
            SequenceState::Settled(settled) => Some(change(settled)),
            SequenceState::Pending(_) => None,
        })?;
        changed.flatten().ok_or_else(|| Error::not_found(topic))
    }

    async fn forget(&self, topic: &str) -> Result<()> {
        self.store.delete(topic)?;
        self.subscriber.remove_subscription(topic).await?;
        self.key_store.delete_agreement_keys(topic)?;
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event dropped, no listener");
        }
    }

    async fn handle_approve(&self, topic: &str, id: i64, params: SessionApproveParams) -> Result<()> {
        let Some(sequence) = self.store.get(topic)? else {
            debug!(topic, "approval for unknown session dropped");
            return Ok(());
        };
        let SequenceState::Pending(pending) = sequence.state else {
            debug!(topic, "approval for settled session dropped");
            return Ok(());
        };
        let self_participant = sequence.self_participant;

        let private_key = self
            .key_store
            .private_key(&self_participant.public_key)?
            .ok_or_else(|| Error::NoAgreementKeys {
                topic: topic.to_string(),
            })?;
        let keys = KeyExchange::agree(&params.responder.public_key, &private_key)?;
        let settled_topic = keys.derive_topic();
        self.key_store.set_agreement_keys(&settled_topic, keys)?;

        let proposal = pending.proposal;
        let controller = if proposal.proposer.controller {
            self_participant.public_key.clone()
        } else {
            params.responder.public_key.clone()
        };
        let settled = SessionSettled {
            peer: params.responder,
            permissions: proposal.permissions,
            controller: Controller {
                public_key: controller,
            },
            state: params.state,
        };
        let session = Session::from_settled(&settled_topic, &settled);
        let sequence = SessionSequence {
            topic: settled_topic.clone(),
            relay: params.relay,
            self_participant,
            expiry: params.expiry,
            state: SequenceState::Settled(settled),
        };
        self.store.update(topic, Some(&settled_topic), &sequence)?;
        self.subscriber.add_subscription(&settled_topic).await?;
        self.subscriber.remove_subscription(topic).await?;
        acknowledge(&self.relay, topic, id).await?;
        self.key_store.delete_agreement_keys(topic)?;

        info!(topic = %settled_topic, "session approved by peer");
        self.emit(SessionEvent::Approved(session));
        Ok(())
    }

    async fn handle_reject(&self, topic: &str, id: i64, params: SessionRejectParams) -> Result<()> {
        if !self.store.get(topic)?.is_some_and(|sequence| !sequence.is_settled()) {
            debug!(topic, "rejection for unknown proposal dropped");
            return Ok(());
        }
        self.store.delete(topic)?;
        self.subscriber.remove_subscription(topic).await?;
        acknowledge(&self.relay, topic, id).await?;
        self.key_store.delete_agreement_keys(topic)?;

        info!(topic, code = params.reason.code, "session proposal rejected by peer");
        self.emit(SessionEvent::Rejected {
            pending_topic: topic.to_string(),
            reason: params.reason,
        });
        Ok(())
    }

    /// Whether the peer of a settled session is its controller
    fn peer_controls(&self, topic: &str) -> Result<Option<bool>> {
        Ok(self.store.get(topic)?.and_then(|sequence| {
            sequence
                .settled()
                .map(|settled| settled.controller.public_key == settled.peer.public_key)
        }))
    }

    async fn handle_upgrade(&self, topic: &str, id: i64, params: SessionUpgradeParams) -> Result<()> {
        match self.peer_controls(topic)? {
            None => {
                debug!(topic, "upgrade for unknown session dropped");
                return Ok(());
            }
            Some(false) => {
                warn!(topic, "upgrade from non-controller refused");
                return refuse(&self.relay, topic, id, &Error::UnauthorizedUpgradeRequest).await;
            }
            Some(true) => {}
        }

        let permissions = self.modify_settled(topic, |settled| {
            settled.permissions = settled.permissions.union(&params.permissions);
            settled.permissions.clone()
        })?;
        acknowledge(&self.relay, topic, id).await?;
        self.emit(SessionEvent::Upgraded {
            topic: topic.to_string(),
            permissions,
        });
        Ok(())
    }

    async fn handle_update(&self, topic: &str, id: i64, params: SessionUpdateParams) -> Result<()> {
        match self.peer_controls(topic)? {
            None => {
                debug!(topic, "update for unknown session dropped");
                return Ok(());
            }
            Some(false) => {
                warn!(topic, "update from non-controller refused");
                return refuse(&self.relay, topic, id, &Error::UnauthorizedUpdateRequest).await;
            }
            Some(true) => {}
        }

        let accounts = self.modify_settled(topic, |settled| {
            settled.state.accounts.extend(params.state.accounts);
            settled.state.accounts.clone()
        })?;
        acknowledge(&self.relay, topic, id).await?;
        self.emit(SessionEvent::Updated {
            topic: topic.to_string(),
            accounts,
        });
        Ok(())
    }

    async fn handle_payload(
        &self,
        topic: &str,
        id: i64,
        jsonrpc: String,
        params: SessionPayloadParams,
    ) -> Result<()> {
        let Some(settled) = self.store.get(topic)?.and_then(|s| s.settled().cloned()) else {
            debug!(topic, "payload for unknown session dropped");
            return Ok(());
        };

        let method = params.request.method;
        if !settled.permissions.allows_method(&method) {
            warn!(topic, method = %method, "unauthorized method refused");
            return refuse(&self.relay, topic, id, &Error::UnauthorizedMethod(method)).await;
        }
        if let Some(chain_id) = params.chain_id.as_deref() {
            if !settled.permissions.allows_chain(chain_id) {
                warn!(topic, chain_id, "unauthorized chain refused");
                let error = Error::UnauthorizedChain(chain_id.to_string());
                return refuse(&self.relay, topic, id, &error).await;
            }
        }

        self.emit(SessionEvent::PayloadRequest(SessionRequest {
            topic: topic.to_string(),
            request: JsonRpcRequest {
                id,
                jsonrpc,
                method,
                params: params.request.params,
            },
            chain_id: params.chain_id,
        }));
        Ok(())
    }

    async fn handle_delete(&self, topic: &str, id: i64, params: DeleteParams) -> Result<()> {
        if self.store.get(topic)?.is_none() {
            debug!(topic, "delete for unknown session dropped");
            return Ok(());
        }
        if let Err(e) = acknowledge(&self.relay, topic, id).await {
            debug!(topic, "delete ack not sent: {}", e);
        }
        self.forget(topic).await?;

        info!(topic, code = params.reason.code, "session deleted by peer");
        self.emit(SessionEvent::Deleted {
            topic: topic.to_string(),
            reason: params.reason,
        });
        Ok(())
    }
}

#[async_trait]
impl Engine for SessionEngine {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<()> {
        let InboundRequest { topic, request } = inbound;
        let id = request.id;
        match request.params {
            WcParams::SessionApprove(params) => self.handle_approve(&topic, id, params).await,
            WcParams::SessionReject(params) => self.handle_reject(&topic, id, params).await,
            WcParams::SessionUpgrade(params) => self.handle_upgrade(&topic, id, params).await,
            WcParams::SessionUpdate(params) => self.handle_update(&topic, id, params).await,
            WcParams::SessionPayload(params) => {
                self.handle_payload(&topic, id, request.jsonrpc, params).await
            }
            WcParams::SessionDelete(params) => self.handle_delete(&topic, id, params).await,
            WcParams::SessionPing(_) => acknowledge(&self.relay, &topic, id).await,
            other => {
                warn!(topic = %topic, method = %other.method(), "unexpected method on session topic");
                Ok(())
            }
        }
    }

    async fn restore_subscriptions(&self) -> Result<()> {
        for sequence in self.store.get_all()? {
            self.subscriber.add_subscription(&sequence.topic).await?;
        }
        Ok(())
    }

    async fn sweep(&self) -> Result<()> {
        self.sweep_expired().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MemoryKeyStore;
    use crate::jsonrpc::JsonRpcErrorResponse;
    use crate::relay::{RelayConfig, RelayError};
    use crate::store::{current_timestamp, Clock, KeyValueStore, MemoryKeyValueStore, DAY};
    use crate::transport::memory::MemoryRelay;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const PAIRING_TOPIC: &str = "pairing-topic";

    struct Side {
        engine: Arc<SessionEngine>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        relay: Arc<Relay>,
        key_store: Arc<MemoryKeyStore>,
        clock: Arc<AtomicU64>,
    }

    fn side(hub: &MemoryRelay, is_controller: bool) -> Side {
        let (transport, transport_events) = hub.connect();
        let key_store = Arc::new(MemoryKeyStore::new());
        let relay = Relay::new(
            Arc::new(transport),
            transport_events,
            key_store.clone(),
            RelayConfig::default(),
        );
        let now = Arc::new(AtomicU64::new(current_timestamp()));
        let clock: Clock = {
            let now = now.clone();
            Arc::new(move || now.load(Ordering::SeqCst))
        };
        let store = SequenceStore::with_clock(Arc::new(MemoryKeyValueStore::new()), "session:", clock);
        let (tx, events) = mpsc::unbounded_channel();
        let engine = SessionEngine::new(
            relay.clone(),
            key_store.clone(),
            store,
            is_controller,
            AppMetadata::named(if is_controller { "wallet" } else { "dapp" }),
            tx,
        );
        Side {
            engine,
            events,
            relay,
            key_store,
            clock: now,
        }
    }

    /// Both sides share pairing keys and the responder listens on the
    /// pairing topic, answering proposals the way a pairing engine would.
    async fn paired() -> (MemoryRelay, Side, Side, mpsc::UnboundedReceiver<SessionProposal>) {
        let hub = MemoryRelay::new();
        let proposer = side(&hub, false);
        let responder = side(&hub, true);

        let (alice, _) = KeyExchange::generate_key_pair();
        let (_, bob_pub) = KeyExchange::generate_key_pair();
        let keys = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();
        proposer.key_store.set_agreement_keys(PAIRING_TOPIC, keys.clone()).unwrap();
        responder.key_store.set_agreement_keys(PAIRING_TOPIC, keys).unwrap();
        proposer.relay.subscribe(PAIRING_TOPIC).await.unwrap();
        responder.relay.subscribe(PAIRING_TOPIC).await.unwrap();

        let (proposals_tx, proposals) = mpsc::unbounded_channel();
        let relay = responder.relay.clone();
        let key_store = responder.key_store.clone();
        let mut inbound = relay.subscribe_requests();
        tokio::spawn(async move {
            while let Ok(InboundRequest { topic, request }) = inbound.recv().await {
                if let WcParams::PairingPayload(params) = request.params {
                    let proposal = params.request.params;
                    let keys = key_store.agreement_keys(&topic).unwrap().unwrap();
                    key_store.set_agreement_keys(&proposal.topic, keys).unwrap();
                    acknowledge(&relay, &topic, request.id).await.unwrap();
                    let _ = proposals_tx.send(proposal);
                }
            }
        });

        (hub, proposer, responder, proposals)
    }

    async fn next_event(side: &mut Side) -> SessionEvent {
        timeout(Duration::from_secs(2), side.events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn settled(
        permissions: SessionPermissions,
        accounts: &[&str],
    ) -> (MemoryRelay, Side, Side, String) {
        let (hub, mut proposer, mut responder, mut proposals) = paired().await;
        proposer
            .engine
            .propose_session(PAIRING_TOPIC, permissions, RelayProtocolOptions::default())
            .await
            .unwrap();
        let proposal = timeout(Duration::from_secs(2), proposals.recv())
            .await
            .unwrap()
            .unwrap();
        let accounts = accounts.iter().map(|a| a.to_string()).collect();
        let session = responder.engine.approve(&proposal, accounts).await.unwrap();

        assert_eq!(next_event(&mut responder).await, SessionEvent::Approved(session.clone()));
        match next_event(&mut proposer).await {
            SessionEvent::Approved(theirs) => assert_eq!(theirs.topic, session.topic),
            other => panic!("unexpected {other:?}"),
        }
        (hub, proposer, responder, session.topic)
    }

    #[tokio::test]
    async fn test_approve_settles_both_sides() {
        let (_hub, proposer, responder, topic) =
            settled(SessionPermissions::new(["eip155:1"], ["eth_sign"]), &["0xabc"]).await;

        let ours = proposer.engine.settled_sessions().unwrap();
        let theirs = responder.engine.settled_sessions().unwrap();
        assert_eq!(ours.len(), 1);
        assert_eq!(theirs.len(), 1);
        assert_eq!(ours[0].topic, topic);
        assert_eq!(ours[0].peer, Some(AppMetadata::named("wallet")));
        assert_eq!(theirs[0].peer, Some(AppMetadata::named("dapp")));
        assert!(ours[0].accounts.contains("0xabc"));

        timeout(Duration::from_secs(2), proposer.engine.ping(&topic))
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(2), responder.engine.ping(&topic))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_approve_rejects_matching_controller() {
        let (_hub, proposer, _responder, mut proposals) = paired().await;
        proposer
            .engine
            .propose_session(PAIRING_TOPIC, SessionPermissions::default(), RelayProtocolOptions::default())
            .await
            .unwrap();
        let proposal = proposals.recv().await.unwrap();

        assert!(matches!(
            proposer.engine.approve(&proposal, BTreeSet::new()).await,
            Err(Error::UnauthorizedMatchingController)
        ));
    }

    #[tokio::test]
    async fn test_reject_notifies_proposer() {
        let (_hub, mut proposer, responder, mut proposals) = paired().await;
        let proposal = proposer
            .engine
            .propose_session(PAIRING_TOPIC, SessionPermissions::default(), RelayProtocolOptions::default())
            .await
            .unwrap();
        let received = proposals.recv().await.unwrap();

        responder
            .engine
            .reject(&received, Reason::new(4001, "User rejected"))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut proposer).await,
            SessionEvent::Rejected {
                pending_topic: proposal.topic.clone(),
                reason: Reason::new(4001, "User rejected"),
            }
        );
        assert!(proposer.engine.get(&proposal.topic).unwrap().is_none());
        assert!(proposer.engine.settled_sessions().unwrap().is_empty());
        assert!(responder.engine.settled_sessions().unwrap().is_empty());
        assert!(responder.key_store.agreement_keys(&proposal.topic).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let (_hub, proposer, mut responder, topic) =
            settled(SessionPermissions::new(["eip155:1"], ["eth_sign"]), &[]).await;

        let call = tokio::spawn({
            let engine = proposer.engine.clone();
            let topic = topic.clone();
            async move {
                engine
                    .request(PayloadRequestParams {
                        topic,
                        method: "eth_sign".to_string(),
                        params: serde_json::json!(["0xabc", "0xdead"]),
                        chain_id: Some("eip155:1".to_string()),
                    })
                    .await
            }
        });

        let SessionEvent::PayloadRequest(request) = next_event(&mut responder).await else {
            panic!("expected payload request");
        };
        assert_eq!(request.request.method, "eth_sign");
        assert_eq!(request.chain_id.as_deref(), Some("eip155:1"));
        responder
            .engine
            .respond(
                &request.topic,
                JsonRpcResponse::new(request.request.id, serde_json::json!("0xsigned")).into(),
            )
            .await
            .unwrap();

        let response = timeout(Duration::from_secs(2), call).await.unwrap().unwrap().unwrap();
        assert_eq!(response.result, serde_json::json!("0xsigned"));
    }

    #[tokio::test]
    async fn test_unauthorized_method_never_dispatched() {
        let (_hub, proposer, mut responder, topic) =
            settled(SessionPermissions::new(["eip155:1"], ["eth_sign"]), &[]).await;

        let result = proposer
            .engine
            .request(PayloadRequestParams {
                topic,
                method: "eth_sendTransaction".to_string(),
                params: serde_json::json!([]),
                chain_id: None,
            })
            .await;

        match result {
            Err(Error::Relay(RelayError::Rejected(error))) => assert_eq!(error.code, 3001),
            other => panic!("unexpected {other:?}"),
        }
        assert!(responder.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unauthorized_chain_refused() {
        let (_hub, proposer, _responder, topic) =
            settled(SessionPermissions::new(["eip155:1"], ["eth_sign"]), &[]).await;

        let error = proposer
            .engine
            .request(PayloadRequestParams {
                topic,
                method: "eth_sign".to_string(),
                params: serde_json::json!([]),
                chain_id: Some("eip155:5".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(error.code(), Some(3000));
    }

    #[tokio::test]
    async fn test_upgrade_is_monotonic_on_both_sides() {
        let (_hub, mut proposer, mut responder, topic) =
            settled(SessionPermissions::new(["eip155:1"], ["eth_sign"]), &["0xabc"]).await;
        let requested = SessionPermissions::new(["eip155:42"], ["eth_sendTransaction"]);

        let upgraded = responder.engine.upgrade(&topic, requested.clone()).await.unwrap();
        let previous = SessionPermissions::new(["eip155:1"], ["eth_sign"]);
        assert!(upgraded.is_superset(&previous.union(&requested)));

        let SessionEvent::Upgraded { permissions, .. } = next_event(&mut proposer).await else {
            panic!("expected upgrade");
        };
        assert_eq!(permissions, upgraded);
        assert!(matches!(
            next_event(&mut responder).await,
            SessionEvent::Upgraded { .. }
        ));
    }

    #[tokio::test]
    async fn test_non_controller_cannot_upgrade_or_update() {
        let (_hub, proposer, _responder, topic) =
            settled(SessionPermissions::default(), &["0xabc"]).await;

        assert!(matches!(
            proposer.engine.upgrade(&topic, SessionPermissions::default()).await,
            Err(Error::UnauthorizedUpgradeRequest)
        ));
        assert!(matches!(
            proposer.engine.update(&topic, BTreeSet::new()).await,
            Err(Error::UnauthorizedUpdateRequest)
        ));
    }

    #[tokio::test]
    async fn test_peer_refuses_upgrade_from_non_controller() {
        let (_hub, proposer, _responder, topic) =
            settled(SessionPermissions::default(), &["0xabc"]).await;

        let request = WcRequest::new(WcParams::SessionUpgrade(SessionUpgradeParams {
            permissions: SessionPermissions::new(["eip155:5"], ["eth_sign"]),
        }));
        match proposer.relay.request(&topic, &request).await {
            Err(RelayError::Rejected(error)) => assert_eq!(error.code, 3004),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_unions_accounts() {
        let (_hub, mut proposer, responder, topic) =
            settled(SessionPermissions::default(), &["0xabc"]).await;

        let added: BTreeSet<String> = ["0xdef".to_string()].into_iter().collect();
        let accounts = responder.engine.update(&topic, added).await.unwrap();
        let expected: BTreeSet<String> = ["0xabc", "0xdef"].iter().map(|a| a.to_string()).collect();
        assert_eq!(accounts, expected);

        assert_eq!(
            next_event(&mut proposer).await,
            SessionEvent::Updated {
                topic: topic.clone(),
                accounts: expected,
            }
        );
    }

    #[tokio::test]
    async fn test_delete_reaches_peer() {
        let (hub, proposer, mut responder, topic) =
            settled(SessionPermissions::default(), &[]).await;

        proposer
            .engine
            .delete(&topic, Reason::new(6000, "User disconnected"))
            .await
            .unwrap();
        assert!(proposer.engine.get(&topic).unwrap().is_none());

        assert_eq!(
            next_event(&mut responder).await,
            SessionEvent::Deleted {
                topic: topic.clone(),
                reason: Reason::new(6000, "User disconnected"),
            }
        );
        assert!(responder.engine.settled_sessions().unwrap().is_empty());
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_found() {
        let (_hub, proposer, _responder, topic) =
            settled(SessionPermissions::default(), &[]).await;

        proposer.clock.fetch_add(SESSION_DEFAULT_TTL + DAY, Ordering::SeqCst);
        assert!(matches!(
            proposer.engine.ping(&topic).await,
            Err(Error::NotFound { .. })
        ));
        assert!(proposer.engine.settled_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_session() {
        let (hub, mut proposer, _responder, topic) =
            settled(SessionPermissions::default(), &[]).await;
        assert_eq!(hub.subscriber_count(&topic), 2);
        assert!(proposer.engine.sweep_expired().await.unwrap().is_empty());

        proposer.clock.fetch_add(SESSION_DEFAULT_TTL + DAY, Ordering::SeqCst);
        assert_eq!(proposer.engine.sweep_expired().await.unwrap(), vec![topic.clone()]);

        assert_eq!(
            next_event(&mut proposer).await,
            SessionEvent::Expired {
                topic: topic.clone()
            }
        );
        assert!(proposer.key_store.agreement_keys(&topic).unwrap().is_none());
        assert_eq!(hub.subscriber_count(&topic), 1);
        assert!(proposer.engine.sweep_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approve_rollback_leaves_nothing_behind() {
        let hub = MemoryRelay::new();
        let (transport, transport_events) = hub.connect();
        let key_store = Arc::new(MemoryKeyStore::new());
        let relay = Relay::new(
            Arc::new(transport),
            transport_events,
            key_store.clone(),
            RelayConfig {
                request_timeout: Some(Duration::from_millis(100)),
                ..RelayConfig::default()
            },
        );
        let storage = Arc::new(MemoryKeyValueStore::new());
        let (tx, _events) = mpsc::unbounded_channel();
        let engine = SessionEngine::new(
            relay,
            key_store.clone(),
            SequenceStore::new(storage.clone(), "session:"),
            true,
            AppMetadata::named("wallet"),
            tx,
        );

        let (_, proposer_public) = KeyExchange::generate_key_pair();
        let proposal = SessionProposal {
            topic: generate_topic(),
            relay: RelayProtocolOptions::default(),
            proposer: SessionProposer {
                public_key: proposer_public.to_hex(),
                controller: false,
                metadata: None,
            },
            signal: SessionSignal::pairing(PAIRING_TOPIC),
            permissions: SessionPermissions::default(),
            ttl: SESSION_DEFAULT_TTL,
        };

        assert!(engine.approve(&proposal, BTreeSet::new()).await.is_err());
        assert!(storage.keys().unwrap().is_empty());
        assert!(engine.settled_sessions().unwrap().is_empty());
        assert_eq!(hub.subscriber_count(&proposal.topic), 0);
    }

    #[tokio::test]
    async fn test_respond_to_unknown_session_is_not_found() {
        let hub = MemoryRelay::new();
        let side = side(&hub, true);
        let response = JsonRpcErrorResponse::new(1, 3001, "nope").into();
        assert!(matches!(
            side.engine.respond("nope", response).await,
            Err(Error::NotFound { .. })
        ));
    }
}
