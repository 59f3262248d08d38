//! Long-lived signing identities.

use std::collections::HashMap;
use std::sync::RwLock;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::constants::{
    EXPIRATION_DELTA, INVITE_REQUEST_KEY, MAX_CHANNEL_NAME_LENGTH, MAX_DISPLAY_NAME_LENGTH,
    MAX_JSON_LIMITS, PUBLIC_KEY_LENGTH,
};
use crate::core_channel::Channel;
use crate::core_crypto::{keyed_hash32, sealed_box};
use crate::error::{Error, Result};
use crate::proto;
use crate::types::{now_seconds, ChannelId, MessageHash, PeerId};

use super::chain::Chain;
use super::link::Link;

/// Maximum JSON body size for a signer with the given chain length.
/// `None` means the chain length can never sign a JSON body.
pub fn max_json_size(chain_length: usize) -> Option<usize> {
    MAX_JSON_LIMITS.get(chain_length).copied()
}

/// A named Ed25519 keypair with one signing chain per channel membership.
///
/// The secret key is owned exclusively by the identity and wiped on
/// [`Identity::clear`] or drop.
pub struct Identity {
    name: String,
    public_key: [u8; PUBLIC_KEY_LENGTH],
    signing: RwLock<Option<SigningKey>>,
    chains: RwLock<HashMap<ChannelId, Chain>>,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn new(name: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            name: name.to_string(),
            public_key,
            signing: RwLock::new(Some(signing_key)),
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild an identity from persisted parts.
    pub fn from_parts(name: String, seed: [u8; 32], chains: HashMap<ChannelId, Chain>) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            name,
            public_key,
            signing: RwLock::new(Some(signing_key)),
            chains: RwLock::new(chains),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public_key
    }

    /// Secret seed for persistence. Fails after [`Identity::clear`].
    pub fn secret_seed(&self) -> Result<[u8; 32]> {
        let guard = self.signing.read().expect("signing lock poisoned");
        let key = guard.as_ref().ok_or(Error::Closed)?;
        Ok(key.to_bytes())
    }

    /// Sign arbitrary bytes with the identity key.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let guard = self.signing.read().expect("signing lock poisoned");
        let key = guard.as_ref().ok_or(Error::Closed)?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    /// Wipe the secret key. Every signing operation fails afterwards.
    pub fn clear(&self) {
        let mut guard = self.signing.write().expect("signing lock poisoned");
        // SigningKey zeroizes its secret on drop.
        guard.take();
        self.chains.write().expect("chains lock poisoned").clear();
    }

    /// Store the chain that makes this identity a member of `channel`,
    /// replacing any previous chain for that channel.
    pub fn add_chain(&self, channel: &Channel, chain: Chain) {
        self.chains
            .write()
            .expect("chains lock poisoned")
            .insert(*channel.id(), chain);
    }

    /// The chain held for `channel_id`, if any.
    pub fn chain_for(&self, channel_id: &ChannelId) -> Option<Chain> {
        self.chains
            .read()
            .expect("chains lock poisoned")
            .get(channel_id)
            .cloned()
    }

    /// Snapshot of all held chains, for persistence.
    pub fn chains(&self) -> HashMap<ChannelId, Chain> {
        self.chains.read().expect("chains lock poisoned").clone()
    }

    /// Issue a delegation link for `trustee_pub_key` on `channel`.
    ///
    /// Validity defaults to `[now, now + 99 days]`.
    pub fn issue_link(
        &self,
        channel: &Channel,
        trustee_pub_key: &[u8; PUBLIC_KEY_LENGTH],
        display_name: &str,
        validity: Option<(f64, f64)>,
    ) -> Result<Link> {
        if display_name.len() > MAX_DISPLAY_NAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "display name exceeds {} bytes",
                MAX_DISPLAY_NAME_LENGTH
            )));
        }
        let (valid_from, valid_to) = validity.unwrap_or_else(|| {
            let now = now_seconds();
            (now, now + EXPIRATION_DELTA)
        });
        if valid_to <= valid_from || valid_to - valid_from > EXPIRATION_DELTA {
            return Err(Error::InvalidArgument(
                "link validity window out of bounds".into(),
            ));
        }
        let tbs = Link::tbs(trustee_pub_key, display_name, valid_from, valid_to, channel.id());
        Ok(Link {
            trustee_pub_key: *trustee_pub_key,
            trustee_display_name: display_name.to_string(),
            valid_from,
            valid_to,
            signature: self.sign(&tbs)?,
        })
    }

    /// Build and sign the content of a channel message.
    ///
    /// Fails with [`Error::NoChain`] when the identity is not a member of
    /// the channel, and with [`Error::BodyTooLarge`] when a JSON body
    /// exceeds the limit for the chain length.
    pub fn sign_message_body(
        &self,
        body: proto::Body,
        channel: &Channel,
        parents: &[MessageHash],
        height: u64,
        timestamp: f64,
    ) -> Result<proto::Content> {
        let chain = self
            .chain_for(channel.id())
            .ok_or_else(|| Error::NoChain(channel.name().to_string()))?;

        if let Some(proto::body::Body::Json(json)) = &body.body {
            let limit = max_json_size(chain.len()).unwrap_or(0);
            if json.len() > limit {
                return Err(Error::BodyTooLarge { size: json.len(), limit });
            }
        }

        let tbs = proto::ContentTbs {
            parents: parents.iter().map(|p| p.as_bytes().to_vec()).collect(),
            height: height as i64,
            chain: chain.to_proto(),
            timestamp,
            body: Some(body.clone()),
        };
        let signature = self.sign(&proto::encode(&tbs))?;

        Ok(proto::Content {
            chain: chain.to_proto(),
            timestamp,
            body: Some(body),
            signature,
        })
    }

    /// Create an invite request advertising this identity as the trustee.
    ///
    /// The returned [`InviteBox`] holds the ephemeral X25519 secret that
    /// can open the matching [`proto::EncryptedInvite`]; the secret never
    /// leaves the box and is wiped on drop.
    pub fn request_invite(&self, peer_id: &PeerId) -> (proto::InviteRequest, InviteBox) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let box_pub_key = X25519PublicKey::from(&secret);
        let request = proto::InviteRequest {
            peer_id: peer_id.as_bytes().to_vec(),
            trustee_pub_key: self.public_key.to_vec(),
            box_pub_key: box_pub_key.as_bytes().to_vec(),
        };
        let request_id = keyed_hash32(INVITE_REQUEST_KEY, &self.public_key);
        (request, InviteBox { secret, request_id })
    }

    /// Issue an invite for the requester, extending this identity's chain
    /// by one link and sealing the payload to the requester's box key.
    pub fn issue_invite(
        &self,
        channel: &Channel,
        request: &proto::InviteRequest,
        invitee_name: &str,
    ) -> Result<(proto::EncryptedInvite, PeerId)> {
        let peer_id = PeerId::from_slice(&request.peer_id).map_err(Error::Ban)?;
        let trustee_pub_key: [u8; PUBLIC_KEY_LENGTH] = request
            .trustee_pub_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidInvite("bad trustee key length".into()))?;
        let box_pub_key: [u8; PUBLIC_KEY_LENGTH] = request
            .box_pub_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidInvite("bad box key length".into()))?;

        let chain = self
            .chain_for(channel.id())
            .ok_or_else(|| Error::NoChain(channel.name().to_string()))?;
        let link = self.issue_link(channel, &trustee_pub_key, invitee_name, None)?;
        let full_chain = chain.append(link)?;

        let invite = proto::Invite {
            channel_pub_key: channel.public_key().to_vec(),
            channel_name: channel.name().to_string(),
            chain: full_chain.to_proto(),
        };
        let sealed = sealed_box::seal(&box_pub_key, &proto::encode(&invite));

        let encrypted = proto::EncryptedInvite {
            request_id: keyed_hash32(INVITE_REQUEST_KEY, &trustee_pub_key).to_vec(),
            r#box: sealed,
        };
        Ok((encrypted, peer_id))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("public_key", &hex::encode(&self.public_key[..8]))
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Holder of the ephemeral invite-decryption secret.
pub struct InviteBox {
    secret: StaticSecret,
    request_id: [u8; 32],
}

impl InviteBox {
    /// Hex-encoded request id used to match the incoming encrypted invite.
    pub fn request_id(&self) -> String {
        hex::encode(self.request_id)
    }

    /// Open an encrypted invite addressed to this request.
    pub fn decrypt(&self, encrypted: &proto::EncryptedInvite) -> Result<proto::Invite> {
        if encrypted.request_id != self.request_id {
            return Err(Error::InvalidInvite("request id mismatch".into()));
        }
        let plaintext = sealed_box::open(&self.secret, &encrypted.r#box)
            .map_err(|_| Error::InvalidInvite("sealed box did not open".into()))?;
        let invite: proto::Invite = proto::decode(&plaintext)
            .map_err(|_| Error::InvalidInvite("malformed invite payload".into()))?;

        if invite.channel_pub_key.len() != PUBLIC_KEY_LENGTH {
            return Err(Error::InvalidInvite("bad channel key length".into()));
        }
        if invite.channel_name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(Error::InvalidInvite("channel name too long".into()));
        }
        Ok(invite)
    }
}

impl std::fmt::Debug for InviteBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InviteBox")
            .field("request_id", &hex::encode(&self.request_id[..8]))
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_identity_has_keys() {
        let identity = Identity::new("alice");
        assert_eq!(identity.name(), "alice");
        assert_eq!(identity.public_key().len(), 32);
    }

    #[test]
    fn test_sign_fails_after_clear() {
        let identity = Identity::new("alice");
        assert!(identity.sign(b"data").is_ok());
        identity.clear();
        assert!(matches!(identity.sign(b"data"), Err(Error::Closed)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let identity = Identity::new("alice");
        let debug = format!("{:?}", identity);
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_max_json_size_table() {
        assert_eq!(max_json_size(1), Some(2_097_152));
        assert_eq!(max_json_size(2), Some(524_288));
        assert_eq!(max_json_size(3), Some(8_192));
        assert_eq!(max_json_size(4), None);
    }

    #[test]
    fn test_request_invite_box_matches() {
        let alice = Identity::new("alice");
        let peer_id = PeerId::from_bytes([9u8; 32]);
        let (request, invite_box) = alice.request_invite(&peer_id);
        assert_eq!(request.trustee_pub_key, alice.public_key().to_vec());
        assert_eq!(
            invite_box.request_id(),
            hex::encode(keyed_hash32(INVITE_REQUEST_KEY, alice.public_key()))
        );
    }

    #[test]
    fn test_invite_box_rejects_wrong_request_id() {
        let alice = Identity::new("alice");
        let (_, invite_box) = alice.request_invite(&PeerId::from_bytes([9u8; 32]));
        let bogus = proto::EncryptedInvite {
            request_id: vec![0u8; 32],
            r#box: vec![1, 2, 3],
        };
        assert!(matches!(
            invite_box.decrypt(&bogus),
            Err(Error::InvalidInvite(_))
        ));
    }

    #[test]
    fn test_from_parts_restores_public_key() {
        let identity = Identity::new("alice");
        let seed = identity.secret_seed().unwrap();
        let restored = Identity::from_parts("alice".into(), seed, HashMap::new());
        assert_eq!(restored.public_key(), identity.public_key());
    }
}
