//! Cryptographic primitives.
//!
//! Thin wrappers over the RustCrypto stack: keyed BLAKE2b hashing,
//! XChaCha20-Poly1305 secretboxes for channel content, and an anonymous
//! sealed box for invite transport. Ed25519 signing lives with the
//! identities that own the keys.

pub mod hash;
pub mod sealed_box;
pub mod secret_box;

pub use hash::{hash32, keyed_hash24, keyed_hash32};
pub use secret_box::SecretBox;

use rand::rngs::OsRng;
use rand::RngCore;

/// Fill a fixed-size array from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_not_constant() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }
}
