//! Pairing proposal, settlement and request params

use serde::{Deserialize, Serialize};

use super::session::SessionProposal;
use super::{AppMetadata, Controller, JsonRpcPermissions, Participant, RelayProtocolOptions};
use super::uri::PairingUri;
use crate::jsonrpc::WcMethod;
use crate::store::{Sequence, DAY};

/// Lifetime offered for a settled pairing
pub const PAIRING_PROPOSAL_TTL: u64 = 30 * DAY;

/// A pairing sequence, pending or settled
pub type PairingSequence = Sequence<PairingProposal, PairingSettled>;

/// Proposing side of a pairing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingProposer {
    /// Proposer's hex public key
    pub public_key: String,
    /// Whether the proposer claims the controller role
    pub controller: bool,
}

/// Out-of-band signal carrying the pairing URI
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSignal {
    /// Signal kind, always `uri`
    #[serde(rename = "type")]
    pub kind: String,
    /// Signal payload
    pub params: PairingSignalParams,
}

/// Payload of [`PairingSignal`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSignalParams {
    /// Pairing URI
    pub uri: String,
}

/// Permissions a pairing is proposed with
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingProposedPermissions {
    /// Methods the pairing channel may carry
    pub jsonrpc: JsonRpcPermissions,
}

impl Default for PairingProposedPermissions {
    /// Pairing channels only carry session proposals
    fn default() -> Self {
        PairingProposedPermissions {
            jsonrpc: JsonRpcPermissions {
                methods: [WcMethod::SessionPropose.as_str().to_string()]
                    .into_iter()
                    .collect(),
            },
        }
    }
}

/// A pairing proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingProposal {
    /// Proposal topic
    pub topic: String,
    /// Relay protocol
    pub relay: RelayProtocolOptions,
    /// Proposing side
    pub proposer: PairingProposer,
    /// Out-of-band signal
    pub signal: PairingSignal,
    /// Proposed permissions
    pub permissions: PairingProposedPermissions,
    /// Settled lifetime in seconds
    pub ttl: u64,
}

impl PairingProposal {
    /// Rebuild the proposal a URI was generated from
    pub fn from_uri(uri: &PairingUri) -> Self {
        PairingProposal {
            topic: uri.topic.clone(),
            relay: uri.relay.clone(),
            proposer: PairingProposer {
                public_key: uri.public_key.clone(),
                controller: uri.controller,
            },
            signal: PairingSignal {
                kind: "uri".to_string(),
                params: PairingSignalParams {
                    uri: uri.to_string(),
                },
            },
            permissions: PairingProposedPermissions::default(),
            ttl: PAIRING_PROPOSAL_TTL,
        }
    }

    /// The URI to hand to the peer out of band
    pub fn uri(&self) -> &str {
        &self.signal.params.uri
    }
}

/// Permissions of a settled pairing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPermissions {
    /// Methods the pairing channel may carry
    pub jsonrpc: JsonRpcPermissions,
    /// Controlling side
    pub controller: Controller,
}

/// Opaque pairing state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingState {
    /// Peer metadata, if shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// Settled half of a pairing sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSettled {
    /// The other side
    pub peer: Participant,
    /// Channel permissions
    pub permissions: PairingPermissions,
    /// Opaque state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PairingState>,
}

/// `wc_pairingApprove` params
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingApproveParams {
    /// Relay protocol
    pub relay: RelayProtocolOptions,
    /// Responding side
    pub responder: Participant,
    /// Absolute expiry, unix seconds
    pub expiry: u64,
    /// Opaque state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PairingState>,
}

/// `wc_pairingPayload` params
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayloadParams {
    /// Nested request
    pub request: PairingPayloadRequest,
}

/// Request tunnelled over a pairing.
///
/// `params` travels as an embedded JSON string, not a nested object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayloadRequest {
    /// Inner method; only `wc_sessionPropose` is allowed
    pub method: String,
    /// Inner params
    #[serde(with = "json_string")]
    pub params: SessionProposal,
}

/// Settled pairing as reported to the application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    /// Settled topic
    pub topic: String,
    /// Peer metadata, when the peer shared any
    pub peer: Option<AppMetadata>,
}

mod json_string {
    use serde::de::{DeserializeOwned, Error as _};
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        let json = serde_json::to_string(value).map_err(S::Error::custom)?;
        serializer.serialize_str(&json)
    }

    pub fn deserialize<'de, T: DeserializeOwned, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<T, D::Error> {
        let json = String::deserialize(deserializer)?;
        serde_json::from_str(&json).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionPermissions, SessionProposer, SessionSignal};

    fn sample_session_proposal() -> SessionProposal {
        SessionProposal {
            topic: "c0ffee".to_string(),
            relay: RelayProtocolOptions::default(),
            proposer: SessionProposer {
                public_key: "ab".repeat(32),
                controller: false,
                metadata: Some(AppMetadata::named("dapp")),
            },
            signal: SessionSignal::pairing("beef"),
            permissions: SessionPermissions::default(),
            ttl: 60,
        }
    }

    #[test]
    fn test_payload_params_are_double_encoded() {
        let params = PairingPayloadParams {
            request: PairingPayloadRequest {
                method: WcMethod::SessionPropose.as_str().to_string(),
                params: sample_session_proposal(),
            },
        };

        let value = serde_json::to_value(&params).unwrap();
        let inner = &value["request"]["params"];
        assert!(inner.is_string(), "inner params must be a JSON string");

        let decoded: SessionProposal = serde_json::from_str(inner.as_str().unwrap()).unwrap();
        assert_eq!(decoded, sample_session_proposal());

        let restored: PairingPayloadParams = serde_json::from_value(value).unwrap();
        assert_eq!(restored, params);
    }

    #[test]
    fn test_nested_object_params_rejected() {
        let json = serde_json::json!({
            "request": {
                "method": "wc_sessionPropose",
                "params": serde_json::to_value(sample_session_proposal()).unwrap()
            }
        });
        assert!(serde_json::from_value::<PairingPayloadParams>(json).is_err());
    }

    #[test]
    fn test_default_permissions_only_allow_session_propose() {
        let permissions = PairingProposedPermissions::default();
        assert_eq!(permissions.jsonrpc.methods.len(), 1);
        assert!(permissions.jsonrpc.methods.contains("wc_sessionPropose"));
    }

    #[test]
    fn test_participant_wire_names() {
        let participant = Participant::new("ab", Some(AppMetadata::named("wallet")));
        let json = serde_json::to_value(&participant).unwrap();
        assert_eq!(json["publicKey"], "ab");
        assert_eq!(json["metadata"]["name"], "wallet");
    }
}
