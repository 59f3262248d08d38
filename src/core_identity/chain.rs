//! Ordered link chains.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_CHAIN_LENGTH, PUBLIC_KEY_LENGTH};
use crate::error::{BanError, Error, Result};
use crate::proto;
use crate::types::ChannelId;

use super::link::Link;

/// Ordered sequence of up to three [`Link`]s from a channel's root key to
/// a leaf signing key. The empty chain means the root key signs directly
/// and is only valid for the channel creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    links: Vec<Link>,
}

impl Chain {
    /// Wrap a link sequence, enforcing the length bound.
    pub fn new(links: Vec<Link>) -> Result<Self> {
        if links.len() > MAX_CHAIN_LENGTH {
            return Err(Error::Ban(BanError::ChainTooLong(links.len())));
        }
        Ok(Self { links })
    }

    /// The root-signs-directly chain.
    pub fn empty() -> Self {
        Self { links: Vec::new() }
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Extend this chain by one more delegation.
    pub fn append(&self, link: Link) -> Result<Self> {
        let mut links = self.links.clone();
        links.push(link);
        Self::new(links)
    }

    /// Walk the chain starting from the channel root key, verifying each
    /// link at `timestamp`. Returns the leaf key authorized to sign.
    pub fn verify(
        &self,
        channel_pub_key: &[u8; PUBLIC_KEY_LENGTH],
        channel_id: &ChannelId,
        timestamp: f64,
    ) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        if self.links.len() > MAX_CHAIN_LENGTH {
            return Err(Error::Ban(BanError::ChainTooLong(self.links.len())));
        }
        let mut current_signer = *channel_pub_key;
        for link in &self.links {
            if !link.verify(&current_signer, channel_id, timestamp) {
                return Err(Error::Ban(BanError::InvalidSignature));
            }
            current_signer = link.trustee_pub_key;
        }
        Ok(current_signer)
    }

    /// Ordering between two chains held for the same channel: shorter is
    /// better; at equal length, byte-compare the last trustee key.
    pub fn is_better_than(&self, other: &Chain) -> bool {
        if self.links.len() != other.links.len() {
            return self.links.len() < other.links.len();
        }
        match (self.links.last(), other.links.last()) {
            (Some(ours), Some(theirs)) => ours.trustee_pub_key < theirs.trustee_pub_key,
            _ => false,
        }
    }

    pub fn to_proto(&self) -> Vec<proto::Link> {
        self.links.iter().map(Link::to_proto).collect()
    }

    /// Parse and shape-check a wire chain.
    pub fn from_proto(links: &[proto::Link]) -> Result<Self> {
        if links.len() > MAX_CHAIN_LENGTH {
            return Err(Error::Ban(BanError::ChainTooLong(links.len())));
        }
        let links = links.iter().map(Link::from_proto).collect::<Result<Vec<_>>>()?;
        Self::new(links)
    }
}
