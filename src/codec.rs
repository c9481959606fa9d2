//! Message envelope codec
//!
//! Outbound payloads are JSON encoded and, when agreement keys exist for
//! the topic, sealed with the topic's envelope key. Inbound messages are
//! opened the same way and classified as request, response or error
//! response, tried in that order.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{Cipher, CryptoError, KeyStore};
use crate::jsonrpc::{JsonRpcErrorResponse, JsonRpcResponse, WcRequest};
use crate::store::StoreError;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON encoding failed
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Sealing or opening the envelope failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Key lookup failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// A classified inbound message
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// Protocol request
    Request(WcRequest),
    /// Successful response
    Response(JsonRpcResponse),
    /// Error response
    Error(JsonRpcErrorResponse),
    /// Valid envelope, unknown shape
    Unrecognized,
}

/// Envelope codec bound to a key store
#[derive(Clone)]
pub struct Codec {
    key_store: Arc<dyn KeyStore>,
}

impl Codec {
    /// Create a codec reading keys from `key_store`
    pub fn new(key_store: Arc<dyn KeyStore>) -> Self {
        Codec { key_store }
    }

    /// Encode `payload` for publishing on `topic`
    pub fn encode<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> CodecResult<String> {
        let json = serde_json::to_string(payload)?;
        match self.key_store.agreement_keys(topic)? {
            Some(keys) => {
                let key = keys.shared_secret.envelope_key();
                let sealed = Cipher::encrypt_with_aad(&key, json.as_bytes(), topic.as_bytes())?;
                Ok(hex::encode(sealed))
            }
            None => Ok(json),
        }
    }

    /// Decode a message received on `topic`
    pub fn decode(&self, topic: &str, message: &str) -> CodecResult<InboundMessage> {
        let json = match self.key_store.agreement_keys(topic)? {
            Some(keys) => {
                let sealed =
                    hex::decode(message.trim()).map_err(|_| CryptoError::MalformedCiphertext)?;
                let key = keys.shared_secret.envelope_key();
                let opened = Cipher::decrypt_with_aad(&key, &sealed, topic.as_bytes())?;
                String::from_utf8(opened).map_err(|_| CryptoError::MalformedCiphertext)?
            }
            None => message.to_string(),
        };

        Ok(classify(&json))
    }
}

fn classify(json: &str) -> InboundMessage {
    if let Ok(request) = serde_json::from_str::<WcRequest>(json) {
        return InboundMessage::Request(request);
    }
    if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(json) {
        return InboundMessage::Response(response);
    }
    if let Ok(error) = serde_json::from_str::<JsonRpcErrorResponse>(json) {
        return InboundMessage::Error(error);
    }
    InboundMessage::Unrecognized
}
