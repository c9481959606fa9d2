//! X25519 Key Agreement
//!
//! Provides Elliptic Curve Diffie-Hellman (ECDH) key agreement and the
//! derivation of a settled topic from the agreed secret.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::cipher::KEY_SIZE;
use super::error::{CryptoError, CryptoResult};
use super::hash::Hash;

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

const ENVELOPE_KEY_CONTEXT: &str = "pairlink 2024 envelope key v1";

/// An X25519 public key, hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(PublicKey(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Private half of an agreement keypair
#[derive(Clone, ZeroizeOnDrop)]
pub struct PrivateKey {
    secret: [u8; 32],
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        PrivateKey {
            secret: secret.to_bytes(),
        }
    }

    /// Restore from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PrivateKey { secret: bytes }
    }

    /// The matching public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.secret);
        PublicKey(X25519Public::from(&secret).to_bytes())
    }

    /// Compute shared secret with a peer's public key
    pub fn diffie_hellman(&self, peer_public: &PublicKey) -> CryptoResult<SharedSecret> {
        let secret = StaticSecret::from(self.secret);
        let shared = secret.diffie_hellman(&X25519Public::from(peer_public.0));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(SharedSecret {
            secret: shared.to_bytes(),
        })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({:?})", self.public_key())
    }
}

/// Shared secret derived from key agreement
#[derive(Clone, ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the raw bytes (be careful with this!)
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }

    /// Key used to seal envelopes on topics secured by this secret
    pub fn envelope_key(&self) -> [u8; KEY_SIZE] {
        Hash::derive_key(&self.secret, ENVELOPE_KEY_CONTEXT)
    }

    /// Settled topic for this secret: hex(sha256(secret))
    pub fn derive_topic(&self) -> String {
        Hash::sha256_hex(&self.secret)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Keys securing one topic
#[derive(Clone, Debug)]
pub struct AgreementKeys {
    /// Our private key used in the agreement
    pub private_key: PrivateKey,
    /// Agreed secret
    pub shared_secret: SharedSecret,
}

impl AgreementKeys {
    /// Our public key for this agreement
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// Settled topic these keys secure
    pub fn derive_topic(&self) -> String {
        self.shared_secret.derive_topic()
    }
}

/// Key agreement operations
pub struct KeyExchange;

impl KeyExchange {
    /// Generate a fresh keypair
    pub fn generate_key_pair() -> (PrivateKey, PublicKey) {
        let private_key = PrivateKey::generate();
        let public_key = private_key.public_key();
        (private_key, public_key)
    }

    /// Agree on a shared secret with a peer given its hex public key
    pub fn agree(peer_public_key: &str, private_key: &PrivateKey) -> CryptoResult<AgreementKeys> {
        let peer = PublicKey::from_hex(peer_public_key)?;
        let shared_secret = private_key.diffie_hellman(&peer)?;
        Ok(AgreementKeys {
            private_key: private_key.clone(),
            shared_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_agreement() {
        let (alice, alice_pub) = KeyExchange::generate_key_pair();
        let (bob, bob_pub) = KeyExchange::generate_key_pair();

        let alice_keys = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();
        let bob_keys = KeyExchange::agree(&alice_pub.to_hex(), &bob).unwrap();

        assert_eq!(
            alice_keys.shared_secret.as_bytes(),
            bob_keys.shared_secret.as_bytes()
        );
        assert_eq!(alice_keys.derive_topic(), bob_keys.derive_topic());
    }

    #[test]
    fn test_different_peers_different_topics() {
        let (alice, _) = KeyExchange::generate_key_pair();
        let (_, bob_pub) = KeyExchange::generate_key_pair();
        let (_, carol_pub) = KeyExchange::generate_key_pair();

        let alice_bob = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();
        let alice_carol = KeyExchange::agree(&carol_pub.to_hex(), &alice).unwrap();

        assert_ne!(alice_bob.derive_topic(), alice_carol.derive_topic());
    }

    #[test]
    fn test_topic_is_sha256_hex() {
        let (alice, _) = KeyExchange::generate_key_pair();
        let (_, bob_pub) = KeyExchange::generate_key_pair();
        let keys = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();

        let topic = keys.shared_secret.derive_topic();
        assert_eq!(topic.len(), 64);
        assert_eq!(topic, Hash::sha256_hex(keys.shared_secret.as_bytes()));
    }

    #[test]
    fn test_malformed_peer_key() {
        let (alice, _) = KeyExchange::generate_key_pair();

        assert_eq!(
            KeyExchange::agree("not-hex", &alice).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
        assert!(matches!(
            KeyExchange::agree("abcd", &alice),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 2 })
        ));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (alice, _) = KeyExchange::generate_key_pair();
        let zero = hex::encode([0u8; 32]);

        assert_eq!(
            KeyExchange::agree(&zero, &alice).unwrap_err(),
            CryptoError::NonContributory
        );
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let (_, public) = KeyExchange::generate_key_pair();
        let restored = PublicKey::from_hex(&public.to_hex()).unwrap();
        assert_eq!(public, restored);
    }
}
