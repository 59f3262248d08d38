//! Signed delegation links.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::constants::{
    EXPIRATION_DELTA, MAX_DISPLAY_NAME_LENGTH, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::error::{BanError, Error, Result};
use crate::proto;
use crate::types::ChannelId;

/// A signed, time-bounded delegation binding a trustee key to a channel.
///
/// The signature covers the canonical encoding of the link fields with the
/// channel id injected, so a link is valid for exactly one channel even
/// though the id never travels on the wire.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub trustee_pub_key: [u8; PUBLIC_KEY_LENGTH],
    pub trustee_display_name: String,
    pub valid_from: f64,
    pub valid_to: f64,
    /// 64-byte Ed25519 signature by the delegating key.
    pub signature: Vec<u8>,
}

impl Link {
    /// Canonical signing input for the given link fields and channel.
    pub fn tbs(
        trustee_pub_key: &[u8; PUBLIC_KEY_LENGTH],
        trustee_display_name: &str,
        valid_from: f64,
        valid_to: f64,
        channel_id: &ChannelId,
    ) -> Vec<u8> {
        proto::encode(&proto::LinkTbs {
            trustee_pub_key: trustee_pub_key.to_vec(),
            trustee_display_name: trustee_display_name.to_string(),
            valid_from,
            valid_to,
            channel_id: channel_id.as_bytes().to_vec(),
        })
    }

    /// Verify this link against the current signer at `timestamp`.
    pub fn verify(&self, signer: &[u8; PUBLIC_KEY_LENGTH], channel_id: &ChannelId, timestamp: f64) -> bool {
        if timestamp < self.valid_from || timestamp >= self.valid_to {
            return false;
        }
        let verifying_key = match VerifyingKey::from_bytes(signer) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature_bytes: [u8; SIGNATURE_LENGTH] = match self.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let tbs = Self::tbs(
            &self.trustee_pub_key,
            &self.trustee_display_name,
            self.valid_from,
            self.valid_to,
            channel_id,
        );
        verifying_key
            .verify(&tbs, &Signature::from_bytes(&signature_bytes))
            .is_ok()
    }

    /// Wire form. The channel id is transported empty.
    pub fn to_proto(&self) -> proto::Link {
        proto::Link {
            tbs: Some(proto::LinkTbs {
                trustee_pub_key: self.trustee_pub_key.to_vec(),
                trustee_display_name: self.trustee_display_name.clone(),
                valid_from: self.valid_from,
                valid_to: self.valid_to,
                channel_id: Vec::new(),
            }),
            signature: self.signature.clone(),
        }
    }

    /// Parse and shape-check a wire link.
    pub fn from_proto(link: &proto::Link) -> Result<Self> {
        let tbs = link
            .tbs
            .as_ref()
            .ok_or_else(|| BanError::MalformedPacket("link without tbs".into()))?;
        let trustee_pub_key: [u8; PUBLIC_KEY_LENGTH] =
            tbs.trustee_pub_key.as_slice().try_into().map_err(|_| {
                BanError::InvalidLength {
                    field: "trustee public key",
                    actual: tbs.trustee_pub_key.len(),
                }
            })?;
        if link.signature.len() != SIGNATURE_LENGTH {
            return Err(Error::Ban(BanError::InvalidLength {
                field: "link signature",
                actual: link.signature.len(),
            }));
        }
        if tbs.trustee_display_name.len() > MAX_DISPLAY_NAME_LENGTH {
            return Err(Error::Ban(BanError::InvalidLength {
                field: "display name",
                actual: tbs.trustee_display_name.len(),
            }));
        }
        if tbs.valid_to <= tbs.valid_from || tbs.valid_to - tbs.valid_from > EXPIRATION_DELTA {
            return Err(Error::Ban(BanError::MalformedPacket(
                "link validity window out of bounds".into(),
            )));
        }
        Ok(Self {
            trustee_pub_key,
            trustee_display_name: tbs.trustee_display_name.clone(),
            valid_from: tbs.valid_from,
            valid_to: tbs.valid_to,
            signature: link.signature.clone(),
        })
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("trustee", &hex::encode(&self.trustee_pub_key[..8]))
            .field("display_name", &self.trustee_display_name)
            .field("valid_from", &self.valid_from)
            .field("valid_to", &self.valid_to)
            .finish()
    }
}
