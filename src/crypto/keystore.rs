//! Key storage
//!
//! Private keys are looked up by their public key; agreement keys by the
//! topic they secure. Implementations backing real deployments must
//! survive restarts so settled sequences stay readable.

use std::collections::HashMap;
use std::sync::RwLock;

use super::exchange::{AgreementKeys, PrivateKey};
use crate::store::{StoreError, StoreResult};

/// Secure storage for agreement material
pub trait KeyStore: Send + Sync {
    /// Store a private key under its public key
    fn set_private_key(&self, key: PrivateKey) -> StoreResult<()>;

    /// Fetch a private key by its hex public key
    fn private_key(&self, public_key: &str) -> StoreResult<Option<PrivateKey>>;

    /// Forget a private key
    fn delete_private_key(&self, public_key: &str) -> StoreResult<()>;

    /// Store the agreement keys securing `topic`
    fn set_agreement_keys(&self, topic: &str, keys: AgreementKeys) -> StoreResult<()>;

    /// Agreement keys securing `topic`, if any
    fn agreement_keys(&self, topic: &str) -> StoreResult<Option<AgreementKeys>>;

    /// Forget the agreement keys for `topic`
    fn delete_agreement_keys(&self, topic: &str) -> StoreResult<()>;
}

/// In-memory key store
#[derive(Default)]
pub struct MemoryKeyStore {
    private_keys: RwLock<HashMap<String, PrivateKey>>,
    agreement_keys: RwLock<HashMap<String, AgreementKeys>>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn set_private_key(&self, key: PrivateKey) -> StoreResult<()> {
        let public_key = key.public_key().to_hex();
        self.private_keys
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(public_key, key);
        Ok(())
    }

    fn private_key(&self, public_key: &str) -> StoreResult<Option<PrivateKey>> {
        Ok(self
            .private_keys
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(public_key)
            .cloned())
    }

    fn delete_private_key(&self, public_key: &str) -> StoreResult<()> {
        self.private_keys
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(public_key);
        Ok(())
    }

    fn set_agreement_keys(&self, topic: &str, keys: AgreementKeys) -> StoreResult<()> {
        self.agreement_keys
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(topic.to_string(), keys);
        Ok(())
    }

    fn agreement_keys(&self, topic: &str) -> StoreResult<Option<AgreementKeys>> {
        Ok(self
            .agreement_keys
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(topic)
            .cloned())
    }

    fn delete_agreement_keys(&self, topic: &str) -> StoreResult<()> {
        self.agreement_keys
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyExchange;

    #[test]
    fn test_private_key_lookup_by_public_key() {
        let store = MemoryKeyStore::new();
        let (private_key, public_key) = KeyExchange::generate_key_pair();

        store.set_private_key(private_key).unwrap();

        let restored = store.private_key(&public_key.to_hex()).unwrap().unwrap();
        assert_eq!(restored.public_key(), public_key);
        assert!(store.private_key("00").unwrap().is_none());
    }

    #[test]
    fn test_agreement_keys_by_topic() {
        let store = MemoryKeyStore::new();
        let (alice, _) = KeyExchange::generate_key_pair();
        let (_, bob_pub) = KeyExchange::generate_key_pair();
        let keys = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();
        let topic = keys.derive_topic();

        store.set_agreement_keys(&topic, keys).unwrap();
        assert!(store.agreement_keys(&topic).unwrap().is_some());

        store.delete_agreement_keys(&topic).unwrap();
        assert!(store.agreement_keys(&topic).unwrap().is_none());
    }
}
