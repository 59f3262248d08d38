/*
    protocol - Top-level container

    Owns the identity set, the channel set, the live peer sessions, the
    storage binding, and the wait lists that glue them together. Peers
    and channels never own each other; both are arena-owned here and
    referenced by id.
*/

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ProtocolConfig;
use crate::core_channel::Channel;
use crate::core_crypto::random_bytes;
use crate::core_identity::{Chain, Identity};
use crate::core_peer::Peer;
use crate::core_store::Storage;
use crate::core_sync::AgentSigner;
use crate::error::{Error, Result};
use crate::proto;
use crate::types::{now_seconds, ChannelId, PeerId};

pub mod wait_list;

pub use wait_list::{WaitList, Waiter};

/// Entity prefix for persisted channels, keyed by hex channel id.
const CHANNEL_PREFIX: &str = "channel";
/// Entity prefix for persisted identities, keyed by hex public key.
const IDENTITY_PREFIX: &str = "identity";

#[derive(Serialize, Deserialize)]
struct ChannelRecord {
    public_key: [u8; 32],
    name: String,
    is_feed: bool,
    /// JSON text; the encryption key is re-derived from the public key.
    metadata: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    name: String,
    seed: [u8; 32],
    chains: HashMap<ChannelId, Chain>,
}

/// A self-contained PeerLinks instance.
pub struct Protocol {
    config: ProtocolConfig,
    storage: Arc<dyn Storage>,
    peer_id: PeerId,
    identities: RwLock<HashMap<String, Arc<Identity>>>,
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    peers: RwLock<Vec<Arc<Peer>>>,
    invite_wait: Arc<WaitList<proto::EncryptedInvite>>,
    peer_wait: Arc<WaitList<Arc<Peer>>>,
}

impl Protocol {
    pub fn new(storage: Arc<dyn Storage>, config: ProtocolConfig) -> Self {
        Self {
            config,
            storage,
            peer_id: PeerId::from_bytes(random_bytes()),
            identities: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            peers: RwLock::new(Vec::new()),
            invite_wait: Arc::new(WaitList::new()),
            peer_wait: Arc::new(WaitList::new()),
        }
    }

    /// This instance's transport peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Read persisted channels and identities from storage.
    pub async fn load(&self) -> Result<()> {
        for key in self.storage.get_entity_keys(CHANNEL_PREFIX).await? {
            let Some(blob) = self.storage.retrieve_entity(CHANNEL_PREFIX, &key).await? else {
                continue;
            };
            let record: ChannelRecord = bincode::deserialize(&blob)
                .map_err(|err| Error::Storage(format!("corrupt channel entity: {}", err)))?;
            let metadata = record
                .metadata
                .as_deref()
                .and_then(|text| serde_json::from_str(text).ok());
            let channel = Arc::new(Channel::new(
                record.public_key,
                &record.name,
                record.is_feed,
                metadata,
                self.storage.clone(),
                self.config.clone(),
            )?);
            self.channels.write().await.insert(*channel.id(), channel);
        }

        for key in self.storage.get_entity_keys(IDENTITY_PREFIX).await? {
            let Some(blob) = self.storage.retrieve_entity(IDENTITY_PREFIX, &key).await? else {
                continue;
            };
            let record: IdentityRecord = bincode::deserialize(&blob)
                .map_err(|err| Error::Storage(format!("corrupt identity entity: {}", err)))?;
            let identity = Arc::new(Identity::from_parts(
                record.name.clone(),
                record.seed,
                record.chains,
            ));
            self.identities.write().await.insert(record.name, identity);
        }

        info!(
            channels = self.channels.read().await.len(),
            identities = self.identities.read().await.len(),
            "protocol state loaded"
        );
        Ok(())
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        let record = ChannelRecord {
            public_key: *channel.public_key(),
            name: channel.name().to_string(),
            is_feed: channel.is_feed(),
            metadata: channel.metadata().map(|value| value.to_string()),
        };
        let blob = bincode::serialize(&record)
            .map_err(|err| Error::Storage(err.to_string()))?;
        self.storage
            .store_entity(CHANNEL_PREFIX, &channel.id().to_hex(), blob)
            .await
    }

    async fn save_identity(&self, identity: &Identity) -> Result<()> {
        let record = IdentityRecord {
            name: identity.name().to_string(),
            seed: identity.secret_seed()?,
            chains: identity.chains(),
        };
        let blob = bincode::serialize(&record)
            .map_err(|err| Error::Storage(err.to_string()))?;
        self.storage
            .store_entity(IDENTITY_PREFIX, &hex::encode(identity.public_key()), blob)
            .await
    }

    /// Create an identity and its companion channel of the same name.
    pub async fn create_identity(&self, name: &str) -> Result<(Arc<Identity>, Arc<Channel>)> {
        if self.identities.read().await.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        if self.channel_by_name(name).await.is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let identity = Arc::new(Identity::new(name));
        let channel = Arc::new(
            Channel::create(&identity, name, self.storage.clone(), self.config.clone()).await?,
        );

        self.identities
            .write()
            .await
            .insert(name.to_string(), identity.clone());
        self.save_identity(&identity).await?;
        self.register_channel(channel.clone()).await?;

        debug!(name, "identity created");
        Ok((identity, channel))
    }

    /// Register a channel object, rejecting duplicates by name.
    pub async fn add_channel(&self, channel: Arc<Channel>) -> Result<Arc<Channel>> {
        if let Some(existing) = self.channel_by_name(channel.name()).await {
            if existing.id() == channel.id() {
                return Ok(existing);
            }
            return Err(Error::DuplicateName(channel.name().to_string()));
        }
        self.register_channel(channel.clone()).await?;
        Ok(channel)
    }

    async fn register_channel(&self, channel: Arc<Channel>) -> Result<()> {
        self.channels
            .write()
            .await
            .insert(*channel.id(), channel.clone());
        self.save_channel(&channel).await?;

        // Existing sessions subscribe to the new channel immediately.
        let peers = self.peers.read().await.clone();
        for peer in peers {
            let signer = self.signer_for(&channel).await;
            peer.track_channel(channel.clone(), signer).await;
        }
        Ok(())
    }

    /// Accept a decrypted invite: validate its chain, register the
    /// channel, and attach the chain to `identity`.
    pub async fn channel_from_invite(
        &self,
        invite: &proto::Invite,
        identity: &Arc<Identity>,
    ) -> Result<Arc<Channel>> {
        let public_key: [u8; 32] = invite
            .channel_pub_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidInvite("bad channel key length".into()))?;

        let channel = Arc::new(Channel::new(
            public_key,
            &invite.channel_name,
            false,
            None,
            self.storage.clone(),
            self.config.clone(),
        )?);

        let chain = Chain::from_proto(&invite.chain)
            .map_err(|_| Error::InvalidInvite("malformed chain".into()))?;
        let leaf_key = chain
            .verify(channel.public_key(), channel.id(), now_seconds())
            .map_err(|_| Error::InvalidInvite("chain does not verify".into()))?;
        if leaf_key != *identity.public_key() {
            return Err(Error::InvalidInvite(
                "chain does not terminate at this identity".into(),
            ));
        }

        identity.add_chain(&channel, chain);
        self.save_identity(identity).await?;
        self.add_channel(channel).await
    }

    /// Register a read-only feed around a known public key. The DAG
    /// fills through sync.
    pub async fn feed_from_public_key(
        &self,
        name: &str,
        public_key: [u8; 32],
    ) -> Result<Arc<Channel>> {
        let channel = Arc::new(Channel::new(
            public_key,
            name,
            true,
            None,
            self.storage.clone(),
            self.config.clone(),
        )?);
        self.add_channel(channel).await
    }

    pub async fn channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .await
            .values()
            .find(|channel| channel.name() == name)
            .cloned()
    }

    pub async fn channel_by_id(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn identity_by_name(&self, name: &str) -> Option<Arc<Identity>> {
        self.identities.read().await.get(name).cloned()
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels
            .read()
            .await
            .values()
            .map(|channel| channel.name().to_string())
            .collect()
    }

    pub async fn identity_names(&self) -> Vec<String> {
        self.identities.read().await.keys().cloned().collect()
    }

    /// Remove an identity, wiping its secret key and entity blob.
    pub async fn remove_identity(&self, name: &str) -> Result<()> {
        let Some(identity) = self.identities.write().await.remove(name) else {
            return Ok(());
        };
        let key = hex::encode(identity.public_key());
        identity.clear();
        self.storage.remove_entity(IDENTITY_PREFIX, &key).await
    }

    /// Remove a channel, wiping its encryption key, messages, and entity
    /// blob.
    pub async fn remove_channel(&self, name: &str) -> Result<()> {
        let Some(channel) = self.channel_by_name(name).await else {
            return Ok(());
        };
        self.channels.write().await.remove(channel.id());
        channel.clear();
        self.storage.remove_channel_messages(channel.id()).await?;
        self.storage
            .remove_entity(CHANNEL_PREFIX, &channel.id().to_hex())
            .await
    }

    /// Pick the request signer for a channel: the identity holding the
    /// best chain, or an ephemeral key for feeds.
    async fn signer_for(&self, channel: &Channel) -> AgentSigner {
        if channel.is_feed() {
            return AgentSigner::Ephemeral;
        }
        let identities = self.identities.read().await;
        let mut best: Option<(Arc<Identity>, Chain)> = None;
        for identity in identities.values() {
            if let Some(chain) = identity.chain_for(channel.id()) {
                let better = match &best {
                    Some((_, current)) => chain.is_better_than(current),
                    None => true,
                };
                if better {
                    best = Some((identity.clone(), chain));
                }
            }
        }
        match best {
            Some((identity, _)) => AgentSigner::Member(identity),
            None => AgentSigner::Ephemeral,
        }
    }

    /// Run a peer session over an established socket until it closes.
    ///
    /// Registers the peer for the duration of the session and removes it
    /// on exit. Returns the close reason for abnormal terminations.
    pub async fn connect<T>(&self, socket: T) -> Result<Option<String>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (peer, session) = Peer::handshake(
            socket,
            self.peer_id,
            self.config.clone(),
            self.invite_wait.clone(),
        )
        .await?;

        self.peers.write().await.push(peer.clone());

        let channels: Vec<Arc<Channel>> = self.channels.read().await.values().cloned().collect();
        for channel in channels {
            let signer = self.signer_for(&channel).await;
            peer.track_channel(channel, signer).await;
        }

        self.peer_wait
            .resolve_all(&peer.remote_id().to_hex(), peer.clone());

        let reason = session.run().await;
        if let Some(reason) = &reason {
            info!(remote = %peer.remote_id(), reason, "peer session closed");
        }

        self.peers
            .write()
            .await
            .retain(|other| !Arc::ptr_eq(other, &peer));
        Ok(reason)
    }

    /// Resolve once an encrypted invite for `request_id` arrives from any
    /// peer.
    pub fn wait_for_invite(&self, request_id: &str) -> Waiter<proto::EncryptedInvite> {
        self.invite_wait.wait_for(request_id)
    }

    /// The connected peer with `peer_id`, waiting for it to appear if
    /// necessary.
    pub async fn wait_for_peer(&self, peer_id: &PeerId) -> Result<Arc<Peer>> {
        if let Some(peer) = self.peer_by_id(peer_id).await {
            return Ok(peer);
        }
        let waiter = self.peer_wait.wait_for(&peer_id.to_hex());
        // The peer may have connected between the check and registration.
        if let Some(peer) = self.peer_by_id(peer_id).await {
            return Ok(peer);
        }
        waiter.wait().await
    }

    async fn peer_by_id(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .await
            .iter()
            .find(|peer| peer.remote_id() == peer_id)
            .cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Relay an encrypted invite to the connected peer that requested it.
    pub async fn invite(
        &self,
        invite: proto::EncryptedInvite,
        peer_id: &PeerId,
    ) -> Result<()> {
        let peer = self.wait_for_peer(peer_id).await?;
        peer.send_invite(invite).await
    }

    /// Destroy every peer session and fail all pending waiters.
    pub async fn close(&self) {
        let peers = self.peers.read().await.clone();
        for peer in peers {
            peer.destroy("protocol closed").await;
        }
        self.invite_wait.close();
        self.peer_wait.close();
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::MemoryStorage;
    use crate::test_utils::test_config;

    fn new_protocol(storage: Arc<MemoryStorage>) -> Protocol {
        Protocol::new(storage, test_config())
    }

    #[tokio::test]
    async fn test_create_identity_with_companion_channel() {
        let protocol = new_protocol(Arc::new(MemoryStorage::new()));
        let (identity, channel) = protocol.create_identity("alice").await.unwrap();

        assert_eq!(identity.name(), "alice");
        assert_eq!(channel.name(), "alice");
        assert_eq!(channel.public_key(), identity.public_key());
        assert_eq!(channel.message_count().await.unwrap(), 1);
        assert!(identity.chain_for(channel.id()).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_identity_name_rejected() {
        let protocol = new_protocol(Arc::new(MemoryStorage::new()));
        protocol.create_identity("alice").await.unwrap();
        let err = protocol.create_identity("alice").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_load_restores_entities() {
        let storage = Arc::new(MemoryStorage::new());
        let (identity, channel) = {
            let protocol = new_protocol(storage.clone());
            protocol.create_identity("alice").await.unwrap()
        };

        let restored = new_protocol(storage);
        restored.load().await.unwrap();

        let loaded_identity = restored.identity_by_name("alice").await.unwrap();
        assert_eq!(loaded_identity.public_key(), identity.public_key());
        assert!(loaded_identity.chain_for(channel.id()).is_some());

        let loaded_channel = restored.channel_by_name("alice").await.unwrap();
        assert_eq!(loaded_channel.id(), channel.id());
        // Messages live in the shared storage, not the entity blob.
        assert_eq!(loaded_channel.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_identity_wipes_secret() {
        let protocol = new_protocol(Arc::new(MemoryStorage::new()));
        let (identity, _) = protocol.create_identity("alice").await.unwrap();

        protocol.remove_identity("alice").await.unwrap();
        assert!(protocol.identity_by_name("alice").await.is_none());
        assert!(matches!(identity.sign(b"data"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_remove_channel_drops_messages() {
        let protocol = new_protocol(Arc::new(MemoryStorage::new()));
        let (_, channel) = protocol.create_identity("alice").await.unwrap();

        protocol.remove_channel("alice").await.unwrap();
        assert!(protocol.channel_by_name("alice").await.is_none());
        assert_eq!(channel.message_count().await.unwrap(), 0);
        // The encryption key is gone with the channel.
        assert!(matches!(channel.encrypt(b"data"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_feed_from_public_key() {
        let protocol = new_protocol(Arc::new(MemoryStorage::new()));
        let channel = protocol
            .feed_from_public_key("news", [7u8; 32])
            .await
            .unwrap();
        assert!(channel.is_feed());
        assert_eq!(channel.message_count().await.unwrap(), 0);
    }
}
