//! Hashing and key derivation
//!
//! BLAKE3 derives envelope keys from agreed secrets; SHA-256 names the
//! settled topic so that both peers land on the same channel id.

use sha2::{Digest, Sha256};

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Hashing and key derivation operations
pub struct Hash;

impl Hash {
    /// SHA-256 of data
    pub fn sha256(data: &[u8]) -> HashOutput {
        Sha256::digest(data).into()
    }

    /// SHA-256 of data, hex encoded
    pub fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Self::sha256(data))
    }

    /// Derive a key from a master key and context string
    ///
    /// The context should be a unique string identifying the purpose
    /// of this derived key (e.g., "pairlink 2024 envelope key v1")
    pub fn derive_key(master: &[u8; 32], context: &str) -> [u8; 32] {
        blake3::derive_key(context, master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            Hash::sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_key_derivation() {
        let master = [0u8; 32];

        let key1 = Hash::derive_key(&master, "purpose-1");
        let key2 = Hash::derive_key(&master, "purpose-2");

        // Different contexts produce different keys
        assert_ne!(key1, key2);

        // Same context produces same key
        let key1_again = Hash::derive_key(&master, "purpose-1");
        assert_eq!(key1, key1_again);
    }
}
