//! Crate-level error type
//!
//! Engines and the client facade return [`Error`]; lower layers keep their
//! own enums and convert into it.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::relay::RelayError;
use crate::store::StoreError;

/// Malformed pairing URI
pub const CODE_MALFORMED_URI: i64 = 1001;
/// No sequence for the topic
pub const CODE_NO_MATCHING_SEQUENCE: i64 = 1301;
/// Default session rejection
pub const CODE_NOT_APPROVED: i64 = 1601;
/// Target chain not allowed
pub const CODE_UNAUTHORIZED_CHAIN: i64 = 3000;
/// JSON-RPC method not allowed
pub const CODE_UNAUTHORIZED_METHOD: i64 = 3001;
/// Update from a non-controller
pub const CODE_UNAUTHORIZED_UPDATE: i64 = 3003;
/// Upgrade from a non-controller
pub const CODE_UNAUTHORIZED_UPGRADE: i64 = 3004;
/// Both or neither side is controller
pub const CODE_UNAUTHORIZED_MATCHING_CONTROLLER: i64 = 3005;
/// Default deletion
pub const CODE_USER_DISCONNECTED: i64 = 6000;

/// Errors surfaced by engines and the client
#[derive(Error, Debug)]
pub enum Error {
    /// Topic unknown or expired
    #[error("No matching sequence for topic {topic}")]
    NotFound {
        /// Requested topic
        topic: String,
    },

    /// Both sides claim, or both disclaim, the controller role
    #[error("Unauthorized: controller flags match")]
    UnauthorizedMatchingController,

    /// Upgrade attempted by the non-controller
    #[error("Unauthorized upgrade request")]
    UnauthorizedUpgradeRequest,

    /// Update attempted by the non-controller
    #[error("Unauthorized update request")]
    UnauthorizedUpdateRequest,

    /// Method outside the session permissions
    #[error("Unauthorized JSON-RPC method: {0}")]
    UnauthorizedMethod(String),

    /// Chain outside the session permissions
    #[error("Unauthorized target chain: {0}")]
    UnauthorizedChain(String),

    /// Pairing URI could not be parsed
    #[error("Malformed pairing URI: {0}")]
    MalformedUri(String),

    /// No agreement or private key to act on the topic
    #[error("Missing keys for topic {topic}")]
    NoAgreementKeys {
        /// Topic the keys were looked up for
        topic: String,
    },

    /// Key agreement or envelope failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Relay or transport failure, or a peer rejection
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Persistence failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Protocol code carried in error responses, if this error has one
    pub fn code(&self) -> Option<i64> {
        match self {
            Error::NotFound { .. } => Some(CODE_NO_MATCHING_SEQUENCE),
            Error::UnauthorizedMatchingController => Some(CODE_UNAUTHORIZED_MATCHING_CONTROLLER),
            Error::UnauthorizedUpgradeRequest => Some(CODE_UNAUTHORIZED_UPGRADE),
            Error::UnauthorizedUpdateRequest => Some(CODE_UNAUTHORIZED_UPDATE),
            Error::UnauthorizedMethod(_) => Some(CODE_UNAUTHORIZED_METHOD),
            Error::UnauthorizedChain(_) => Some(CODE_UNAUTHORIZED_CHAIN),
            Error::MalformedUri(_) => Some(CODE_MALFORMED_URI),
            Error::Relay(RelayError::Rejected(error)) => Some(error.code),
            _ => None,
        }
    }

    pub(crate) fn not_found(topic: &str) -> Self {
        Error::NotFound {
            topic: topic.to_string(),
        }
    }
}

/// Result type for engine and client operations
pub type Result<T> = std::result::Result<T, Error>;
