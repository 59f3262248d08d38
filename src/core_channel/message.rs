//! Channel messages.
//!
//! A message is stored and transported in encrypted form; the hash that
//! addresses it everywhere is the BLAKE2b-256 digest of the canonical
//! encoding of that encrypted record.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::constants::{NONCE_LENGTH, SIGNATURE_LENGTH};
use crate::core_crypto::hash32;
use crate::core_identity::Chain;
use crate::error::{BanError, Error, Result};
use crate::proto;
use crate::types::{ChannelId, MessageHash};

use super::channel::Channel;

/// Decrypted message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// The unique channel root marker.
    Root,
    /// An opaque JSON document; the core validates only that it parses.
    Json(String),
}

impl Body {
    /// JSON body from a value, serialized canonically.
    pub fn json(value: &serde_json::Value) -> Self {
        Body::Json(value.to_string())
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Body::Root)
    }

    pub fn to_proto(&self) -> proto::Body {
        let body = match self {
            Body::Root => proto::body::Body::Root(proto::body::Root {}),
            Body::Json(json) => proto::body::Body::Json(json.clone()),
        };
        proto::Body { body: Some(body) }
    }

    /// Parse a wire body; a JSON body that does not parse is ban-worthy.
    pub fn from_proto(body: Option<&proto::Body>) -> Result<Self> {
        match body.and_then(|b| b.body.as_ref()) {
            Some(proto::body::Body::Root(_)) => Ok(Body::Root),
            Some(proto::body::Body::Json(json)) => {
                serde_json::from_str::<serde_json::Value>(json)
                    .map_err(|_| Error::Ban(BanError::InvalidJson))?;
                Ok(Body::Json(json.clone()))
            }
            None => Err(Error::Ban(BanError::MalformedPacket("message without body".into()))),
        }
    }
}

/// Decrypted message content.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub chain: Chain,
    pub timestamp: f64,
    pub body: Body,
    /// Ed25519 signature by the chain's leaf key over the message TBS.
    pub signature: Vec<u8>,
}

impl Content {
    fn from_proto(content: &proto::Content) -> Result<Self> {
        if content.signature.len() != SIGNATURE_LENGTH {
            return Err(Error::Ban(BanError::InvalidLength {
                field: "message signature",
                actual: content.signature.len(),
            }));
        }
        Ok(Self {
            chain: Chain::from_proto(&content.chain)?,
            timestamp: content.timestamp,
            body: Body::from_proto(content.body.as_ref())?,
            signature: content.signature.clone(),
        })
    }
}

/// A signed, encrypted channel message together with its decrypted view.
#[derive(Debug, Clone)]
pub struct Message {
    channel_id: ChannelId,
    parents: Vec<MessageHash>,
    height: u64,
    nonce: [u8; NONCE_LENGTH],
    encrypted_content: Vec<u8>,
    hash: MessageHash,
    content: Content,
}

impl Message {
    /// Encrypt freshly signed content into a message.
    pub fn build(
        channel: &Channel,
        content: proto::Content,
        parents: Vec<MessageHash>,
        height: u64,
    ) -> Result<Self> {
        let plaintext = proto::encode(&content);
        let (nonce, encrypted_content) = channel.encrypt(&plaintext)?;

        let wire = proto::ChannelMessage {
            channel_id: channel.id().as_bytes().to_vec(),
            parents: parents.iter().map(|p| p.as_bytes().to_vec()).collect(),
            height: height as i64,
            nonce: nonce.to_vec(),
            encrypted_content,
        };
        let hash = MessageHash::from_bytes(hash32(&proto::encode(&wire)));

        Ok(Self {
            channel_id: *channel.id(),
            parents,
            height,
            nonce,
            encrypted_content: wire.encrypted_content,
            hash,
            content: Content::from_proto(&content)?,
        })
    }

    /// Decode and decrypt a wire message for `channel`.
    ///
    /// Fails with a ban error on any shape violation, a box that does not
    /// open, or a JSON body that does not parse.
    pub fn decrypt(channel: &Channel, wire: &proto::ChannelMessage) -> Result<Self> {
        let channel_id = ChannelId::from_slice(&wire.channel_id).map_err(Error::Ban)?;
        if channel_id != *channel.id() {
            return Err(Error::Ban(BanError::MalformedPacket(
                "message for a different channel".into(),
            )));
        }
        if wire.height < 0 {
            return Err(Error::Ban(BanError::InvalidHeight));
        }
        let nonce: [u8; NONCE_LENGTH] =
            wire.nonce.as_slice().try_into().map_err(|_| BanError::InvalidLength {
                field: "nonce",
                actual: wire.nonce.len(),
            })?;
        let parents = wire
            .parents
            .iter()
            .map(|p| MessageHash::from_slice(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Ban)?;

        let hash = MessageHash::from_bytes(hash32(&proto::encode(wire)));

        let plaintext = channel.decrypt(&wire.encrypted_content, &nonce)?;
        let content: proto::Content = proto::decode(&plaintext)?;

        Ok(Self {
            channel_id,
            parents,
            height: wire.height as u64,
            nonce,
            encrypted_content: wire.encrypted_content.clone(),
            hash,
            content: Content::from_proto(&content)?,
        })
    }

    /// Walk the signing chain and verify the content signature.
    ///
    /// Verification is the precondition for acceptance; any failure along
    /// the walk yields `false`.
    pub fn verify(&self, channel: &Channel) -> bool {
        let leaf_key = match self.content.chain.verify(
            channel.public_key(),
            channel.id(),
            self.content.timestamp,
        ) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&leaf_key) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature_bytes: [u8; SIGNATURE_LENGTH] =
            match self.content.signature.as_slice().try_into() {
                Ok(bytes) => bytes,
                Err(_) => return false,
            };
        let tbs = proto::ContentTbs {
            parents: self.parents.iter().map(|p| p.as_bytes().to_vec()).collect(),
            height: self.height as i64,
            chain: self.content.chain.to_proto(),
            timestamp: self.content.timestamp,
            body: Some(self.content.body.to_proto()),
        };
        verifying_key
            .verify(&proto::encode(&tbs), &Signature::from_bytes(&signature_bytes))
            .is_ok()
    }

    /// Wire and storage form; its canonical encoding is what the hash
    /// covers.
    pub fn to_wire(&self) -> proto::ChannelMessage {
        proto::ChannelMessage {
            channel_id: self.channel_id.as_bytes().to_vec(),
            parents: self.parents.iter().map(|p| p.as_bytes().to_vec()).collect(),
            height: self.height as i64,
            nonce: self.nonce.to_vec(),
            encrypted_content: self.encrypted_content.clone(),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn parents(&self) -> &[MessageHash] {
        &self.parents
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &MessageHash {
        &self.hash
    }

    pub fn timestamp(&self) -> f64 {
        self.content.timestamp
    }

    pub fn body(&self) -> &Body {
        &self.content.body
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}
