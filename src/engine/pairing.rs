//! Pairing engine
//!
//! The proposer creates a pending pairing on a random topic and hands out
//! its URI. The responder agrees on a key, settles on the derived topic and
//! approves on the proposal topic; the proposer then settles on the same
//! derived topic. Settled pairings carry session proposals.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{acknowledge, spawn_loops, Engine};
use crate::crypto::{generate_topic, AgreementKeys, KeyExchange, KeyStore, PrivateKey};
use crate::error::{Error, Result};
use crate::jsonrpc::{WcMethod, WcParams, WcRequest};
use crate::relay::{InboundRequest, Relay, Subscriber};
use crate::store::{Pending, PendingStatus, SequenceState, SequenceStore, PENDING_TTL};
use crate::types::{
    AppMetadata, Controller, DeleteParams, Pairing, PairingApproveParams, PairingPayloadParams,
    PairingPermissions, PairingProposal, PairingSequence, PairingSettled, PairingUri,
    Participant, PingParams, Reason, RelayProtocolOptions, SessionProposal,
};

/// Things the pairing engine reports
#[derive(Clone, Debug, PartialEq)]
pub enum PairingEvent {
    /// Our proposal was approved by a responder
    Approved {
        /// The settled pairing
        pairing: Pairing,
        /// Topic the proposal was made on
        pending_topic: String,
        /// Negotiated relay protocol
        relay: RelayProtocolOptions,
    },
    /// A peer proposed a session over a settled pairing
    SessionProposal(SessionProposal),
    /// The peer deleted a pairing
    Deleted {
        /// Settled topic
        topic: String,
        /// Peer's reason
        reason: Reason,
    },
    /// A pairing or proposal outlived its expiry and was released
    Expired {
        /// Pairing or proposal topic
        topic: String,
    },
}

/// Pairing state machine
pub struct PairingEngine {
    relay: Arc<Relay>,
    subscriber: Arc<Subscriber>,
    key_store: Arc<dyn KeyStore>,
    store: SequenceStore<PairingSequence>,
    is_controller: bool,
    metadata: AppMetadata,
    events: mpsc::UnboundedSender<PairingEvent>,
}

impl PairingEngine {
    /// Create the engine and start handling requests on its topics
    pub fn new(
        relay: Arc<Relay>,
        key_store: Arc<dyn KeyStore>,
        store: SequenceStore<PairingSequence>,
        is_controller: bool,
        metadata: AppMetadata,
        events: mpsc::UnboundedSender<PairingEvent>,
    ) -> Arc<Self> {
        let connections = relay.connection_events();
        let (subscriber, requests) = Subscriber::new(relay.clone());
        let engine = Arc::new(PairingEngine {
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

    /// Create a pairing proposal and wait for a responder on its topic
    pub async fn propose(&self) -> Result<PairingProposal> {
        let (private_key, public_key) = KeyExchange::generate_key_pair();
        let public_key = public_key.to_hex();
        self.key_store.set_private_key(private_key)?;

        let uri = PairingUri {
            topic: generate_topic(),
            public_key: public_key.clone(),
            controller: self.is_controller,
            relay: RelayProtocolOptions::default(),
        };
        let proposal = PairingProposal::from_uri(&uri);
        let topic = proposal.topic.clone();

        let sequence = PairingSequence {
            topic: topic.clone(),
            relay: proposal.relay.clone(),
            self_participant: Participant::new(public_key, Some(self.metadata.clone())),
            expiry: self.store.now() + PENDING_TTL,
            state: SequenceState::Pending(Pending {
                proposal: proposal.clone(),
                status: PendingStatus::Proposed,
            }),
        };
        self.store.set(&topic, &sequence)?;
        self.subscriber.add_subscription(&topic).await?;

        info!(topic = %topic, "pairing proposed");
        Ok(proposal)
    }

    /// Respond to a pairing URI and settle once the proposer acknowledges
    pub async fn pair(&self, uri: &PairingUri) -> Result<Pairing> {
        let proposal = PairingProposal::from_uri(uri);
        if proposal.proposer.controller == self.is_controller {
            return Err(Error::UnauthorizedMatchingController);
        }

        let private_key = PrivateKey::generate();
        let keys = KeyExchange::agree(&proposal.proposer.public_key, &private_key)?;
        let settled_topic = keys.derive_topic();

        self.subscriber.add_subscription(&proposal.topic).await?;
        let result = self.settle_responder(&proposal, private_key, keys).await;
        if result.is_err() {
            self.rollback_responder(&proposal.topic, &settled_topic).await;
        }
        let pairing = result?;

        if let Err(e) = self.subscriber.remove_subscription(&proposal.topic).await {
            warn!(topic = %proposal.topic, "failed to leave proposal topic: {}", e);
        }
        info!(topic = %settled_topic, "pairing settled");
        Ok(pairing)
    }

    async fn settle_responder(
        &self,
        proposal: &PairingProposal,
        private_key: PrivateKey,
        keys: AgreementKeys,
    ) -> Result<Pairing> {
        let self_public_key = private_key.public_key().to_hex();
        let self_participant = Participant::new(self_public_key.clone(), Some(self.metadata.clone()));
        let settled_topic = keys.derive_topic();
        let now = self.store.now();

        let pending = PairingSequence {
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
            self_public_key
        };
        let expiry = now + proposal.ttl;
        let settled = PairingSequence {
            topic: settled_topic.clone(),
            relay: proposal.relay.clone(),
            self_participant: self_participant.clone(),
            expiry,
            state: SequenceState::Settled(PairingSettled {
                peer: Participant::new(proposal.proposer.public_key.clone(), None),
                permissions: PairingPermissions {
                    jsonrpc: proposal.permissions.jsonrpc.clone(),
                    controller: Controller {
                        public_key: controller,
                    },
                },
                state: None,
            }),
        };
        self.store
            .update(&proposal.topic, Some(&settled_topic), &settled)?;
        self.subscriber.add_subscription(&settled_topic).await?;
        self.key_store.set_agreement_keys(&settled_topic, keys)?;
        self.key_store.set_private_key(private_key)?;

        let approve = WcRequest::new(WcParams::PairingApprove(PairingApproveParams {
            relay: proposal.relay.clone(),
            responder: self_participant,
            expiry,
            state: None,
        }));
        self.relay.request(&proposal.topic, &approve).await?;

        Ok(Pairing {
            topic: settled_topic,
            peer: None,
        })
    }

    async fn rollback_responder(&self, proposal_topic: &str, settled_topic: &str) {
        debug!(topic = %proposal_topic, "rolling back failed pairing");
        let stored_self = self
            .store
            .get(settled_topic)
            .ok()
            .flatten()
            .map(|sequence| sequence.self_participant.public_key);

        if let Err(e) = self.store.delete(proposal_topic) {
            warn!("rollback: {}", e);
        }
        if let Err(e) = self.store.delete(settled_topic) {
            warn!("rollback: {}", e);
        }
        if let Err(e) = self.key_store.delete_agreement_keys(settled_topic) {
            warn!("rollback: {}", e);
        }
        if let Some(public_key) = stored_self {
            if let Err(e) = self.key_store.delete_private_key(&public_key) {
                warn!("rollback: {}", e);
            }
        }
        for topic in [proposal_topic, settled_topic] {
            if let Err(e) = self.subscriber.remove_subscription(topic).await {
                warn!("rollback: {}", e);
            }
        }
    }

    /// Check that the peer of a settled pairing is reachable
    pub async fn ping(&self, topic: &str) -> Result<()> {
        if self.store.get(topic)?.is_none() {
            return Err(Error::not_found(topic));
        }
        let request = WcRequest::new(WcParams::PairingPing(PingParams {}));
        self.relay.request(topic, &request).await?;
        debug!(topic, "pairing ping answered");
        Ok(())
    }

    /// Tell the peer and drop the pairing locally
    pub async fn delete(&self, topic: &str, reason: Reason) -> Result<()> {
        if self.store.get(topic)?.is_none() {
            return Err(Error::not_found(topic));
        }
        let request = WcRequest::new(WcParams::PairingDelete(DeleteParams { reason }));
        let published = self.relay.notify(topic, &request).await;
        self.forget(topic).await?;
        published?;
        info!(topic, "pairing deleted");
        Ok(())
    }

    /// Stored pairing for `topic`, pending or settled
    pub fn get(&self, topic: &str) -> Result<Option<PairingSequence>> {
        Ok(self.store.get(topic)?)
    }

    /// Every settled pairing
    pub fn settled_pairings(&self) -> Result<Vec<Pairing>> {
        Ok(self
            .store
            .get_all()?
            .into_iter()
            .filter_map(|sequence| {
                let peer = sequence.settled()?.peer.metadata.clone();
                Some(Pairing {
                    topic: sequence.topic,
                    peer,
                })
            })
            .collect())
    }

    /// Release every expired pairing and report it; returns their topics
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let mut topics = Vec::new();
        for sequence in self.store.take_expired()? {
            let topic = sequence.topic;
            if let Err(e) = self.subscriber.remove_subscription(&topic).await {
                warn!(topic = %topic, "failed to leave expired pairing: {}", e);
            }
            if let Err(e) = self.key_store.delete_agreement_keys(&topic) {
                warn!(topic = %topic, "failed to drop expired pairing keys: {}", e);
            }
            if let Err(e) = self
                .key_store
                .delete_private_key(&sequence.self_participant.public_key)
            {
                warn!(topic = %topic, "failed to drop expired pairing key: {}", e);
            }
            info!(topic = %topic, "pairing expired");
            self.emit(PairingEvent::Expired {
                topic: topic.clone(),
            });
            topics.push(topic);
        }
        Ok(topics)
    }

    async fn forget(&self, topic: &str) -> Result<()> {
        self.store.delete(topic)?;
        self.subscriber.remove_subscription(topic).await?;
        self.key_store.delete_agreement_keys(topic)?;
        Ok(())
    }

    fn emit(&self, event: PairingEvent) {
        if self.events.send(event).is_err() {
            debug!("pairing event dropped, no listener");
        }
    }

    async fn handle_approve(&self, topic: &str, id: i64, params: PairingApproveParams) -> Result<()> {
        let Some(sequence) = self.store.get(topic)? else {
            debug!(topic, "approval for unknown pairing dropped");
            return Ok(());
        };
        let SequenceState::Pending(pending) = sequence.state else {
            debug!(topic, "approval for settled pairing dropped");
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
        let peer = params.responder;
        let settled = PairingSequence {
            topic: settled_topic.clone(),
            relay: params.relay.clone(),
            self_participant,
            expiry: params.expiry,
            state: SequenceState::Settled(PairingSettled {
                peer: peer.clone(),
                permissions: PairingPermissions {
                    jsonrpc: proposal.permissions.jsonrpc,
                    controller: Controller {
                        public_key: controller,
                    },
                },
                state: params.state,
            }),
        };
        self.store.update(topic, Some(&settled_topic), &settled)?;
        self.subscriber.add_subscription(&settled_topic).await?;
        self.subscriber.remove_subscription(topic).await?;
        acknowledge(&self.relay, topic, id).await?;

        info!(topic = %settled_topic, "pairing approved by peer");
        self.emit(PairingEvent::Approved {
            pairing: Pairing {
                topic: settled_topic,
                peer: peer.metadata,
            },
            pending_topic: topic.to_string(),
            relay: params.relay,
        });
        Ok(())
    }

    async fn handle_payload(&self, topic: &str, id: i64, params: PairingPayloadParams) -> Result<()> {
        if !self.store.get(topic)?.is_some_and(|sequence| sequence.is_settled()) {
            warn!(topic, "payload for unknown pairing dropped");
            return Ok(());
        }
        if params.request.method != WcMethod::SessionPropose.as_str() {
            warn!(topic, method = %params.request.method, "forbidden pairing payload method");
            return Ok(());
        }

        let proposal = params.request.params;
        if proposal.signal.params.topic != topic {
            warn!(topic, "session proposal signalled over another pairing");
            return Ok(());
        }
        if let Some(keys) = self.key_store.agreement_keys(topic)? {
            self.key_store.set_agreement_keys(&proposal.topic, keys)?;
        }
        acknowledge(&self.relay, topic, id).await?;

        debug!(topic = %proposal.topic, "session proposal received");
        self.emit(PairingEvent::SessionProposal(proposal));
        Ok(())
    }

    async fn handle_delete(&self, topic: &str, id: i64, params: DeleteParams) -> Result<()> {
        if self.store.get(topic)?.is_none() {
            debug!(topic, "delete for unknown pairing dropped");
            return Ok(());
        }
        if let Err(e) = acknowledge(&self.relay, topic, id).await {
            debug!(topic, "delete ack not sent: {}", e);
        }
        self.forget(topic).await?;

        info!(topic, code = params.reason.code, "pairing deleted by peer");
        self.emit(PairingEvent::Deleted {
            topic: topic.to_string(),
            reason: params.reason,
        });
        Ok(())
    }
}

#[async_trait]
impl Engine for PairingEngine {
    async fn handle_request(&self, inbound: InboundRequest) -> Result<()> {
        let InboundRequest { topic, request } = inbound;
        match request.params {
            WcParams::PairingApprove(params) => self.handle_approve(&topic, request.id, params).await,
            WcParams::PairingPayload(params) => self.handle_payload(&topic, request.id, params).await,
            WcParams::PairingDelete(params) => self.handle_delete(&topic, request.id, params).await,
            WcParams::PairingPing(_) => acknowledge(&self.relay, &topic, request.id).await,
            other => {
                warn!(topic = %topic, method = %other.method(), "unexpected method on pairing topic");
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
