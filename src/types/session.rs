//! Session proposal, settlement and lifecycle params

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::{AppMetadata, Controller, JsonRpcPermissions, Participant, Reason, RelayProtocolOptions};
use crate::jsonrpc::JsonRpcRequest;
use crate::store::{Sequence, DAY};

/// Lifetime offered for a settled session
pub const SESSION_DEFAULT_TTL: u64 = 7 * DAY;

/// A session sequence, pending or settled
pub type SessionSequence = Sequence<SessionProposal, SessionSettled>;

/// Allowed blockchains
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockchain {
    /// Chain identifiers, e.g. `eip155:1`
    pub chains: BTreeSet<String>,
}

/// What a session may be used for
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPermissions {
    /// Allowed chains
    pub blockchain: Blockchain,
    /// Allowed JSON-RPC methods
    pub jsonrpc: JsonRpcPermissions,
}

impl SessionPermissions {
    /// Build from chain and method lists
    pub fn new<C, M>(chains: C, methods: M) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        SessionPermissions {
            blockchain: Blockchain {
                chains: chains.into_iter().map(Into::into).collect(),
            },
            jsonrpc: JsonRpcPermissions {
                methods: methods.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Union of both permission sets; never narrower than either side
    pub fn union(&self, other: &SessionPermissions) -> SessionPermissions {
        SessionPermissions {
            blockchain: Blockchain {
                chains: self
                    .blockchain
                    .chains
                    .union(&other.blockchain.chains)
                    .cloned()
                    .collect(),
            },
            jsonrpc: JsonRpcPermissions {
                methods: self
                    .jsonrpc
                    .methods
                    .union(&other.jsonrpc.methods)
                    .cloned()
                    .collect(),
            },
        }
    }

    /// Whether every chain and method of `other` is allowed here
    pub fn is_superset(&self, other: &SessionPermissions) -> bool {
        self.blockchain.chains.is_superset(&other.blockchain.chains)
            && self.jsonrpc.methods.is_superset(&other.jsonrpc.methods)
    }

    /// Whether `method` may be called over the session
    pub fn allows_method(&self, method: &str) -> bool {
        self.jsonrpc.methods.contains(method)
    }

    /// Whether `chain_id` may be targeted over the session
    pub fn allows_chain(&self, chain_id: &str) -> bool {
        self.blockchain.chains.contains(chain_id)
    }
}

/// Proposing side of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposer {
    /// Proposer's hex public key for this session
    pub public_key: String,
    /// Whether the proposer claims the controller role
    pub controller: bool,
    /// Proposer metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// Where a session proposal was signalled
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSignal {
    /// Signal method, always `pairing`
    pub method: String,
    /// Signal payload
    pub params: SessionSignalParams,
}

impl SessionSignal {
    /// Signal over the given settled pairing topic
    pub fn pairing(topic: impl Into<String>) -> Self {
        SessionSignal {
            method: "pairing".to_string(),
            params: SessionSignalParams {
                topic: topic.into(),
            },
        }
    }
}

/// Payload of [`SessionSignal`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSignalParams {
    /// Pairing topic the proposal travelled over
    pub topic: String,
}

/// A session proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProposal {
    /// Proposal topic
    pub topic: String,
    /// Relay protocol
    pub relay: RelayProtocolOptions,
    /// Proposing side
    pub proposer: SessionProposer,
    /// Pairing the proposal came over
    pub signal: SessionSignal,
    /// Requested permissions
    pub permissions: SessionPermissions,
    /// Settled lifetime in seconds
    pub ttl: u64,
}

/// Account state of a session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Account identifiers
    pub accounts: BTreeSet<String>,
}

/// Settled half of a session sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettled {
    /// The other side
    pub peer: Participant,
    /// Granted permissions
    pub permissions: SessionPermissions,
    /// Controlling side
    pub controller: Controller,
    /// Accounts
    pub state: SessionState,
}

/// `wc_sessionApprove` params
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionApproveParams {
    /// Relay protocol
    pub relay: RelayProtocolOptions,
    /// Responding side
    pub responder: Participant,
    /// Absolute expiry, unix seconds
    pub expiry: u64,
    /// Approved accounts
    pub state: SessionState,
}

/// `wc_sessionReject` params
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRejectParams {
    /// Why the proposal was declined
    pub reason: Reason,
}

/// `wc_sessionUpgrade` params
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpgradeParams {
    /// Permissions to add
    pub permissions: SessionPermissions,
}

/// `wc_sessionUpdate` params
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    /// Accounts to add
    pub state: SessionState,
}

/// `wc_sessionPayload` params
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionPayloadParams {
    /// Tunnelled call
    pub request: SessionPayloadRequest,
    /// Target chain
    #[serde(rename = "chainId", default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

/// Method call tunnelled over a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionPayloadRequest {
    /// Application method
    pub method: String,
    /// Application params
    pub params: Value,
}

/// Settled session as reported to the application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Settled topic
    pub topic: String,
    /// Peer metadata
    pub peer: Option<AppMetadata>,
    /// Granted permissions
    pub permissions: SessionPermissions,
    /// Accounts
    pub accounts: BTreeSet<String>,
}

impl Session {
    pub(crate) fn from_settled(topic: &str, settled: &SessionSettled) -> Self {
        Session {
            topic: topic.to_string(),
            peer: settled.peer.metadata.clone(),
            permissions: settled.permissions.clone(),
            accounts: settled.state.accounts.clone(),
        }
    }
}

/// Inbound application call waiting for [`respond`](crate::Client::respond)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Session topic
    pub topic: String,
    /// The call; its `id` correlates the response
    pub request: JsonRpcRequest<Value>,
    /// Target chain
    pub chain_id: Option<String>,
}

/// Outbound application call
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadRequestParams {
    /// Session topic
    pub topic: String,
    /// Application method
    pub method: String,
    /// Application params
    pub params: Value,
    /// Target chain
    pub chain_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_superset_of_both() {
        let current = SessionPermissions::new(["eip155:1"], ["eth_sign"]);
        let requested = SessionPermissions::new(["eip155:42"], ["eth_sendTransaction", "eth_sign"]);

        let merged = current.union(&requested);

        assert!(merged.is_superset(&current));
        assert!(merged.is_superset(&requested));
        assert_eq!(merged.blockchain.chains.len(), 2);
        assert_eq!(merged.jsonrpc.methods.len(), 2);
    }

    #[test]
    fn test_union_with_empty_is_identity() {
        let current = SessionPermissions::new(["eip155:1"], ["eth_sign"]);
        assert_eq!(current.union(&SessionPermissions::default()), current);
    }

    #[test]
    fn test_payload_params_chain_id_wire_name() {
        let params = SessionPayloadParams {
            request: SessionPayloadRequest {
                method: "eth_sign".to_string(),
                params: serde_json::json!(["0xabc", "0xdead"]),
            },
            chain_id: Some("eip155:1".to_string()),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["chainId"], "eip155:1");

        let no_chain = SessionPayloadParams {
            chain_id: None,
            ..params
        };
        let json = serde_json::to_value(&no_chain).unwrap();
        assert!(json.get("chainId").is_none());
    }
}
