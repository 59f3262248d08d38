//! Anonymous sealed box for invite transport.
//!
//! The sender generates an ephemeral X25519 keypair, derives an AEAD key
//! from the shared secret and both public keys, and prepends the ephemeral
//! public key to the ciphertext:
//!
//!   key   = BLAKE2b-256(shared ‖ epk ‖ rpk)
//!   nonce = BLAKE2b-192(epk ‖ rpk)
//!   out   = epk ‖ XChaCha20-Poly1305(key, nonce, plaintext)
//!
//! Only the holder of the recipient secret can open the box; the sender
//! keeps no decryption capability.

use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::hash::{keyed_hash24, keyed_hash32};
use super::secret_box::SecretBox;
use crate::error::{BanError, Error, Result};

const KEY_DOMAIN: &[u8] = b"peerlinks-sealed-box";

fn derive(shared: &[u8; 32], epk: &PublicKey, rpk: &PublicKey) -> ([u8; 32], [u8; 24]) {
    let mut key_input = Vec::with_capacity(96);
    key_input.extend_from_slice(shared);
    key_input.extend_from_slice(epk.as_bytes());
    key_input.extend_from_slice(rpk.as_bytes());
    let key = keyed_hash32(KEY_DOMAIN, &key_input);

    let mut nonce_input = Vec::with_capacity(64);
    nonce_input.extend_from_slice(epk.as_bytes());
    nonce_input.extend_from_slice(rpk.as_bytes());
    let nonce = keyed_hash24(KEY_DOMAIN, &nonce_input);

    (key, nonce)
}

/// Seal `plaintext` to the holder of `recipient` without authenticating
/// the sender.
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let epk = PublicKey::from(&ephemeral);
    let rpk = PublicKey::from(*recipient);
    let shared = ephemeral.diffie_hellman(&rpk);

    let (key, nonce) = derive(shared.as_bytes(), &epk, &rpk);
    let ciphertext = SecretBox::new(key).seal_with_nonce(&nonce, plaintext);

    let mut sealed = Vec::with_capacity(32 + ciphertext.len());
    sealed.extend_from_slice(epk.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Open a sealed box with the recipient's secret key.
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 32 {
        return Err(Error::Ban(BanError::InvalidLength {
            field: "sealed box",
            actual: sealed.len(),
        }));
    }
    let epk_bytes: [u8; 32] = sealed[..32].try_into().expect("length checked");
    let epk = PublicKey::from(epk_bytes);
    let rpk = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&epk);

    let (key, nonce) = derive(shared.as_bytes(), &epk, &rpk);
    SecretBox::new(key).open(&nonce, &sealed[32..])
}
