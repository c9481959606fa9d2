//! ChaCha20-Poly1305 AEAD Encryption
//!
//! Envelopes are sealed with the topic as associated data, so a ciphertext
//! lifted from one topic will not open on another.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric cipher for encryption/decryption
pub struct Cipher;

impl Cipher {
    /// Encrypt data with associated data (AAD)
    ///
    /// Returns: nonce || ciphertext || tag
    pub fn encrypt_with_aad(
        key: &[u8; KEY_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data with associated data (AAD)
    ///
    /// The AAD must match what was used during encryption
    pub fn decrypt_with_aad(
        key: &[u8; KEY_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new(key.into());
        let (nonce, encrypted) = ciphertext.split_at(NONCE_SIZE);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: encrypted,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [42u8; KEY_SIZE];
        let plaintext = br#"{"id":1,"jsonrpc":"2.0","result":true}"#;

        let ciphertext = Cipher::encrypt_with_aad(&key, plaintext, b"topic").unwrap();
        let decrypted = Cipher::decrypt_with_aad(&key, &ciphertext, b"topic").unwrap();

        assert_eq!(plaintext, decrypted.as_slice());
    }

    #[test]
    fn test_ciphertext_different_each_time() {
        let key = [42u8; KEY_SIZE];

        let ct1 = Cipher::encrypt_with_aad(&key, b"Hello", b"t").unwrap();
        let ct2 = Cipher::encrypt_with_aad(&key, b"Hello", b"t").unwrap();

        // Different nonces mean different ciphertexts
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = Cipher::encrypt_with_aad(&[1u8; KEY_SIZE], b"Secret", b"t").unwrap();
        assert_eq!(
            Cipher::decrypt_with_aad(&[2u8; KEY_SIZE], &ciphertext, b"t"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let mut ciphertext = Cipher::encrypt_with_aad(&key, b"Hello", b"t").unwrap();

        if let Some(byte) = ciphertext.get_mut(NONCE_SIZE + 1) {
            *byte ^= 0xFF;
        }

        assert!(Cipher::decrypt_with_aad(&key, &ciphertext, b"t").is_err());
    }

    #[test]
    fn test_wrong_topic_fails() {
        let key = [42u8; KEY_SIZE];
        let ciphertext = Cipher::encrypt_with_aad(&key, b"Hello", b"topic-a").unwrap();

        assert!(Cipher::decrypt_with_aad(&key, &ciphertext, b"topic-b").is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = [42u8; KEY_SIZE];
        assert!(Cipher::decrypt_with_aad(&key, &[0u8; NONCE_SIZE], b"t").is_err());
    }
}
