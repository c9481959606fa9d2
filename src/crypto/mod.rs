//! Cryptographic primitives for pairlink
//!
//! - `exchange`: X25519 key agreement and settled-topic derivation
//! - `cipher`: ChaCha20-Poly1305 envelope sealing
//! - `hash`: BLAKE3 key derivation and SHA-256 topic hashing
//! - `keystore`: storage of private and agreement keys

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod keystore;

pub use cipher::Cipher;
pub use error::{CryptoError, CryptoResult};
pub use exchange::{AgreementKeys, KeyExchange, PrivateKey, PublicKey, SharedSecret};
pub use hash::Hash;
pub use keystore::{KeyStore, MemoryKeyStore};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Random 32-byte topic, hex encoded
pub fn generate_topic() -> String {
    hex::encode(random_bytes::<32>())
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_full_envelope_flow() {
        // Two parties agree on a channel
        let (alice, alice_pub) = KeyExchange::generate_key_pair();
        let (bob, bob_pub) = KeyExchange::generate_key_pair();

        let alice_keys = KeyExchange::agree(&bob_pub.to_hex(), &alice).unwrap();
        let bob_keys = KeyExchange::agree(&alice_pub.to_hex(), &bob).unwrap();
        let topic = alice_keys.derive_topic();

        // Alice seals on the settled topic
        let message = br#"{"id":1,"jsonrpc":"2.0","method":"wc_sessionPing","params":{}}"#;
        let ciphertext = Cipher::encrypt_with_aad(
            &alice_keys.shared_secret.envelope_key(),
            message,
            topic.as_bytes(),
        )
        .unwrap();

        // Bob opens with his own derivation
        let decrypted = Cipher::decrypt_with_aad(
            &bob_keys.shared_secret.envelope_key(),
            &ciphertext,
            bob_keys.derive_topic().as_bytes(),
        )
        .unwrap();
        assert_eq!(message, decrypted.as_slice());
    }

    #[test]
    fn test_generate_topic_is_random_hex() {
        let a = generate_topic();
        let b = generate_topic();
        assert_eq!(a.len(), 64);
        assert!(hex::decode(&a).is_ok());
        assert_ne!(a, b);
    }
}
