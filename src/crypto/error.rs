//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The peer public key is malformed or not usable for agreement
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// Agreement produced an all-zero secret (low-order peer point)
    #[error("Key agreement was not contributory")]
    NonContributory,

    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed - authentication tag mismatch (possibly tampered data)
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Ciphertext was not valid hex
    #[error("Malformed ciphertext encoding")]
    MalformedCiphertext,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
