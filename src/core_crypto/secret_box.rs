//! Symmetric channel encryption.
//!
//! XChaCha20-Poly1305 under the channel's derived 32-byte key with random
//! 24-byte nonces. A failed open is always attributable to the sender and
//! therefore ban-worthy.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::NONCE_LENGTH;
use crate::error::{BanError, Error, Result};

/// Symmetric AEAD bound to a single 32-byte key.
///
/// The key is wiped from memory when the box is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBox {
    key: [u8; 32],
}

impl SecretBox {
    /// Wrap an existing symmetric key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt under a fresh random nonce. Returns `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> ([u8; NONCE_LENGTH], Vec<u8>) {
        let nonce: [u8; NONCE_LENGTH] = super::random_bytes();
        let ciphertext = self.seal_with_nonce(&nonce, plaintext);
        (nonce, ciphertext)
    }

    /// Encrypt under a caller-supplied nonce.
    pub fn seal_with_nonce(&self, nonce: &[u8; NONCE_LENGTH], plaintext: &[u8]) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .expect("AEAD encryption is infallible for in-memory buffers")
    }

    /// Decrypt and authenticate; MAC failure is ban-worthy.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LENGTH {
            return Err(Error::Ban(BanError::InvalidLength {
                field: "nonce",
                actual: nonce.len(),
            }));
        }
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Ban(BanError::DecryptionFailed))
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").field("key", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let secret = SecretBox::new([3u8; 32]);
        let (nonce, ciphertext) = secret.seal(b"attack at dawn");
        let plaintext = secret.open(&nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"attack at dawn");
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = SecretBox::new([1u8; 32]);
        let mallory = SecretBox::new([2u8; 32]);
        let (nonce, ciphertext) = alice.seal(b"secret");
        let err = mallory.open(&nonce, &ciphertext).unwrap_err();
        assert!(err.is_ban());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let secret = SecretBox::new([1u8; 32]);
        let (nonce, mut ciphertext) = secret.seal(b"secret");
        ciphertext[0] ^= 0xff;
        assert!(secret.open(&nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let secret = SecretBox::new([1u8; 32]);
        let (_, ciphertext) = secret.seal(b"secret");
        let err = secret.open(&[0u8; 12], &ciphertext).unwrap_err();
        assert!(matches!(
            err,
            Error::Ban(BanError::InvalidLength { field: "nonce", .. })
        ));
    }
}
