//! BLAKE2b hashing.
//!
//! Channel ids, symmetric keys, invite request ids, and message content
//! hashes are all 32-byte BLAKE2b digests; sealed-box nonces use the
//! 24-byte variant. Keys double as domain separators.

use blake2::digest::consts::{U24, U32};
use blake2::digest::Mac;
use blake2::{Blake2b, Blake2bMac, Digest};

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;
type Blake2bMac192 = Blake2bMac<U24>;

/// Unkeyed 32-byte BLAKE2b digest.
pub fn hash32(data: &[u8]) -> [u8; 32] {
    let digest = Blake2b256::digest(data);
    digest.into()
}

/// Keyed 32-byte BLAKE2b digest. Key must be at most 64 bytes.
pub fn keyed_hash32(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Blake2bMac256::new_from_slice(key).expect("key within BLAKE2b bounds");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Keyed 24-byte BLAKE2b digest. Key must be at most 64 bytes.
pub fn keyed_hash24(key: &[u8], data: &[u8]) -> [u8; 24] {
    let mut mac = Blake2bMac192::new_from_slice(key).expect("key within BLAKE2b bounds");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash32_is_deterministic() {
        assert_eq!(hash32(b"peerlinks"), hash32(b"peerlinks"));
        assert_ne!(hash32(b"peerlinks"), hash32(b"peerlink"));
    }

    #[test]
    fn test_keyed_hash_separates_domains() {
        let data = b"same input";
        let a = keyed_hash32(b"domain-a", data);
        let b = keyed_hash32(b"domain-b", data);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keyed_differs_from_unkeyed() {
        let data = b"input";
        assert_ne!(keyed_hash32(b"key", data), hash32(data));
    }

    #[test]
    fn test_keyed_hash24_length() {
        let digest = keyed_hash24(b"key", b"data");
        assert_eq!(digest.len(), 24);
    }
}
