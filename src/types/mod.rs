//! Protocol data model
//!
//! Participants, relay options and permission sets shared by pairings and
//! sessions, plus the per-kind proposal and parameter types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{CODE_NOT_APPROVED, CODE_USER_DISCONNECTED};

pub mod pairing;
pub mod session;
pub mod uri;

pub use pairing::*;
pub use session::*;
pub use uri::PairingUri;

/// Application metadata shown to the peer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Home page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Icon URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icons: Option<Vec<String>>,
}

impl AppMetadata {
    /// Metadata with only a name
    pub fn named(name: impl Into<String>) -> Self {
        AppMetadata {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// One side of a sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Hex X25519 public key
    pub public_key: String,
    /// Optional application metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

impl Participant {
    /// Create a participant
    pub fn new(public_key: impl Into<String>, metadata: Option<AppMetadata>) -> Self {
        Participant {
            public_key: public_key.into(),
            metadata,
        }
    }
}

/// Negotiated relay protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    /// Protocol name
    pub protocol: String,
    /// Opaque protocol parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<String>>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        RelayProtocolOptions {
            protocol: "waku".to_string(),
            params: None,
        }
    }
}

/// Side authoritative for permission negotiation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controller {
    /// Controller's hex public key
    pub public_key: String,
}

/// Reason attached to rejections and deletions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Numeric reason code
    pub code: i64,
    /// Human readable message
    pub message: String,
}

impl Reason {
    /// Create a reason
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Reason {
            code,
            message: message.into(),
        }
    }

    /// Default reason for declining a session proposal
    pub fn not_approved() -> Self {
        Reason::new(CODE_NOT_APPROVED, "Session not approved")
    }

    /// Default reason for tearing down a pairing or session
    pub fn user_disconnected() -> Self {
        Reason::new(CODE_USER_DISCONNECTED, "User disconnected")
    }
}

/// Allowed JSON-RPC methods
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcPermissions {
    /// Method names
    pub methods: BTreeSet<String>,
}

/// Empty params object (`{}`) used by ping requests
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingParams {}

/// Params of delete requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteParams {
    /// Why the sequence was deleted
    pub reason: Reason,
}
