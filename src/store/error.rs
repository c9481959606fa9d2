//! Error types for persistence

use thiserror::Error;

/// Persistence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Value could not be encoded for storage
    #[error("Failed to encode value: {0}")]
    Encode(String),

    /// Stored value could not be decoded
    #[error("Failed to decode value at {key}: {reason}")]
    Decode {
        /// Storage key
        key: String,
        /// Decoder message
        reason: String,
    },

    /// A lock guarding the store was poisoned
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result type for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;
