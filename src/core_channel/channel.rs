//! Channel state and DAG acceptance.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::constants::{
    CHANNEL_ID_KEY, CHANNEL_SYMMETRIC_KEY, FUTURE, MAX_BULK_COUNT, MAX_CHANNEL_NAME_LENGTH,
    MAX_JSON_LIMITS, MAX_LEAVES_COUNT, MAX_PARENT_DELTA, NONCE_LENGTH, PUBLIC_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use crate::core_crypto::{keyed_hash32, SecretBox};
use crate::core_identity::{Chain, Identity};
use crate::core_store::{Cursor, Storage};
use crate::error::{BanError, Error, Result};
use crate::proto;
use crate::protocol::WaitList;
use crate::types::{now_seconds, ChannelId, MessageHash};

use super::message::{Body, Message};

/// Wait-list key matched by any message.
const ANY_MESSAGE: &str = "*";

/// Parent list and hash of a message, as exchanged during discovery.
#[derive(Debug, Clone)]
pub struct AbbreviatedEntry {
    pub parents: Vec<MessageHash>,
    pub hash: MessageHash,
}

/// Decrypted query response.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub abbreviated: Vec<AbbreviatedEntry>,
    pub forward_hash: Option<MessageHash>,
    pub backward_hash: Option<MessageHash>,
}

impl QueryResult {
    pub fn to_proto(&self) -> proto::QueryResponse {
        proto::QueryResponse {
            abbreviated_messages: self
                .abbreviated
                .iter()
                .map(|entry| proto::AbbreviatedMessage {
                    parents: entry.parents.iter().map(|p| p.as_bytes().to_vec()).collect(),
                    hash: entry.hash.as_bytes().to_vec(),
                })
                .collect(),
            forward_hash: self
                .forward_hash
                .map(|h| h.as_bytes().to_vec())
                .unwrap_or_default(),
            backward_hash: self
                .backward_hash
                .map(|h| h.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Parse and shape-check a wire query response.
    pub fn from_proto(response: &proto::QueryResponse) -> Result<Self> {
        let abbreviated = response
            .abbreviated_messages
            .iter()
            .map(|abbr| {
                Ok(AbbreviatedEntry {
                    parents: abbr
                        .parents
                        .iter()
                        .map(|p| MessageHash::from_slice(p))
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                    hash: MessageHash::from_slice(&abbr.hash)?,
                })
            })
            .collect::<std::result::Result<Vec<_>, BanError>>()
            .map_err(Error::Ban)?;

        let forward_hash = optional_hash(&response.forward_hash)?;
        let backward_hash = optional_hash(&response.backward_hash)?;
        Ok(Self { abbreviated, forward_hash, backward_hash })
    }
}

fn optional_hash(bytes: &[u8]) -> Result<Option<MessageHash>> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(MessageHash::from_slice(bytes).map_err(Error::Ban)?))
    }
}

/// Decrypted bulk response.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub messages: Vec<proto::ChannelMessage>,
    pub forward_index: u32,
}

/// The remote end of a sync exchange.
///
/// Implemented over the wire by the sync agent, and directly by
/// channel-to-channel couplings in tests.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn query(&self, cursor: Cursor, is_backward: bool, limit: u32) -> Result<QueryResult>;
    async fn bulk(&self, hashes: &[MessageHash]) -> Result<BulkResult>;
}

/// An end-to-end encrypted append-only channel.
pub struct Channel {
    public_key: [u8; PUBLIC_KEY_LENGTH],
    id: ChannelId,
    name: String,
    is_feed: bool,
    metadata: std::sync::RwLock<Option<serde_json::Value>>,
    secret: std::sync::RwLock<Option<SecretBox>>,
    storage: Arc<dyn Storage>,
    config: ProtocolConfig,
    /// Serializes acceptance so DAG invariants hold under concurrency.
    accept_lock: Mutex<()>,
    incoming_wait: WaitList<Message>,
    outgoing_wait: WaitList<Message>,
    update_tx: broadcast::Sender<u64>,
}

impl Channel {
    /// Construct a channel around an existing public key. No root message
    /// is posted; feeds and invited members fill the DAG through sync.
    pub fn new(
        public_key: [u8; PUBLIC_KEY_LENGTH],
        name: &str,
        is_feed: bool,
        metadata: Option<serde_json::Value>,
        storage: Arc<dyn Storage>,
        config: ProtocolConfig,
    ) -> Result<Self> {
        if name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "channel name exceeds {} bytes",
                MAX_CHANNEL_NAME_LENGTH
            )));
        }
        let id = ChannelId::from_bytes(keyed_hash32(CHANNEL_ID_KEY, &public_key));
        let encryption_key = keyed_hash32(CHANNEL_SYMMETRIC_KEY, &public_key);
        let (update_tx, _) = broadcast::channel(64);
        Ok(Self {
            public_key,
            id,
            name: name.to_string(),
            is_feed,
            metadata: std::sync::RwLock::new(metadata),
            secret: std::sync::RwLock::new(Some(SecretBox::new(encryption_key))),
            storage,
            config,
            accept_lock: Mutex::new(()),
            incoming_wait: WaitList::new(),
            outgoing_wait: WaitList::new(),
            update_tx,
        })
    }

    /// Create a channel owned by `identity` and post its root message.
    ///
    /// The channel key is the identity's own key, so the creator signs
    /// with the empty chain, root message and posts alike.
    pub async fn create(
        identity: &Identity,
        name: &str,
        storage: Arc<dyn Storage>,
        config: ProtocolConfig,
    ) -> Result<Self> {
        let channel = Self::new(*identity.public_key(), name, false, None, storage, config)?;

        identity.add_chain(&channel, Chain::empty());
        let content = identity.sign_message_body(
            Body::Root.to_proto(),
            &channel,
            &[],
            0,
            now_seconds(),
        )?;
        let root = Message::build(&channel, content, Vec::new(), 0)?;
        channel.receive(root).await?;
        Ok(channel)
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_feed(&self) -> bool {
        self.is_feed
    }

    pub fn metadata(&self) -> Option<serde_json::Value> {
        self.metadata.read().expect("metadata lock poisoned").clone()
    }

    pub fn set_metadata(&self, metadata: Option<serde_json::Value>) {
        *self.metadata.write().expect("metadata lock poisoned") = metadata;
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Encrypt `data` under the channel symmetric key.
    pub fn encrypt(&self, data: &[u8]) -> Result<([u8; NONCE_LENGTH], Vec<u8>)> {
        let guard = self.secret.read().expect("secret lock poisoned");
        let secret = guard.as_ref().ok_or(Error::Closed)?;
        Ok(secret.seal(data))
    }

    /// Decrypt a box sealed under the channel symmetric key.
    pub fn decrypt(&self, sealed: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let guard = self.secret.read().expect("secret lock poisoned");
        let secret = guard.as_ref().ok_or(Error::Closed)?;
        secret.open(nonce, sealed)
    }

    /// Wipe the channel encryption key.
    pub fn clear(&self) {
        self.secret.write().expect("secret lock poisoned").take();
    }

    /// Subscribe to message-count updates for notification fan-out.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// Resolve once the next message is accepted from a remote.
    pub fn wait_for_incoming_message(&self) -> crate::protocol::Waiter<Message> {
        self.incoming_wait.wait_for(ANY_MESSAGE)
    }

    /// Resolve once the next message is posted locally.
    pub fn wait_for_outgoing_message(&self) -> crate::protocol::Waiter<Message> {
        self.outgoing_wait.wait_for(ANY_MESSAGE)
    }

    /// Resolve once the message with `hash` is accepted.
    pub fn wait_for_message(&self, hash: &MessageHash) -> crate::protocol::Waiter<Message> {
        self.incoming_wait.wait_for(&hash.to_hex())
    }

    pub async fn message_count(&self) -> Result<usize> {
        self.storage.get_message_count(&self.id).await
    }

    pub async fn message_at_offset(&self, offset: usize) -> Result<Option<Message>> {
        self.storage.get_message_at_offset(&self.id, offset).await
    }

    async fn min_leaf_height(&self) -> Result<u64> {
        let leaves = self.storage.get_leaves(&self.id).await?;
        Ok(leaves.iter().map(Message::height).min().unwrap_or(0))
    }

    /// Accept a message into the DAG.
    ///
    /// Returns `false` for an already-stored duplicate. Every other
    /// rejection is a ban-worthy protocol violation by whoever produced
    /// the message.
    pub async fn receive(&self, message: Message) -> Result<bool> {
        let _guard = self.accept_lock.lock().await;
        let accepted = self.receive_inner(&message).await?;
        if accepted {
            self.incoming_wait.resolve_all(&message.hash().to_hex(), message.clone());
            self.incoming_wait.resolve_all(ANY_MESSAGE, message);
        }
        Ok(accepted)
    }

    async fn receive_inner(&self, message: &Message) -> Result<bool> {
        if self.storage.has_message(&self.id, message.hash()).await? {
            return Ok(false);
        }

        if !message.verify(self) {
            return Err(Error::Ban(BanError::InvalidSignature));
        }

        if message.parents().len() > MAX_LEAVES_COUNT {
            return Err(Error::Ban(BanError::TooManyParents(message.parents().len())));
        }

        let parents = self.storage.get_messages(&self.id, message.parents()).await?;
        let mut resolved = Vec::with_capacity(parents.len());
        for (hash, parent) in message.parents().iter().zip(parents) {
            match parent {
                Some(parent) => resolved.push(parent),
                None => {
                    return Err(Error::Ban(BanError::ParentNotFound(hash.to_hex())));
                }
            }
        }

        let parent_max = resolved.iter().map(Message::timestamp).fold(0.0, f64::max);
        if resolved
            .iter()
            .any(|parent| parent.timestamp() < parent_max - MAX_PARENT_DELTA)
        {
            return Err(Error::Ban(BanError::ParentDelta));
        }

        let expected_height = resolved
            .iter()
            .map(Message::height)
            .max()
            .map_or(0, |height| height + 1);
        if message.height() != expected_height {
            return Err(Error::Ban(BanError::InvalidHeight));
        }

        if message.timestamp() > now_seconds() + FUTURE {
            return Err(Error::Ban(BanError::InvalidTimestamp));
        }
        if !resolved.is_empty() && message.timestamp() < parent_max {
            return Err(Error::Ban(BanError::InvalidTimestamp));
        }

        let chain_length = message.content().chain.len();
        if message.parents().is_empty() {
            if !message.body().is_root() {
                return Err(Error::Ban(BanError::InvalidBody(
                    "first message must be a root".into(),
                )));
            }
            if chain_length != 0 {
                return Err(Error::Ban(BanError::InvalidBody(
                    "root must be signed by the channel key".into(),
                )));
            }
            if self.storage.get_message_count(&self.id).await? > 0 {
                return Err(Error::Ban(BanError::InvalidBody("duplicate root".into())));
            }
        } else {
            let Body::Json(json) = message.body() else {
                return Err(Error::Ban(BanError::InvalidBody(
                    "root body outside of root position".into(),
                )));
            };
            // Chain length 0 is the channel owner; their body size is
            // unbounded by the table.
            let limit = MAX_JSON_LIMITS
                .get(chain_length)
                .copied()
                .ok_or(Error::Ban(BanError::ChainTooLong(chain_length)))?;
            if json.len() > limit {
                return Err(Error::Ban(BanError::JsonTooLarge { size: json.len(), limit }));
            }
        }

        self.storage.add_message(message.clone()).await?;
        let count = self.storage.get_message_count(&self.id).await? as u64;
        let _ = self.update_tx.send(count);
        trace!(channel = %self.id, hash = %message.hash(), height = message.height(), "accepted message");
        Ok(true)
    }

    /// Post a JSON body on behalf of `identity`.
    pub async fn post(
        &self,
        body: serde_json::Value,
        identity: &Identity,
        timestamp: Option<f64>,
    ) -> Result<Message> {
        let _guard = self.accept_lock.lock().await;

        let leaves = self.storage.get_leaves(&self.id).await?;
        let max_leaf_timestamp = leaves.iter().map(Message::timestamp).fold(0.0, f64::max);
        let usable: Vec<&Message> = leaves
            .iter()
            .filter(|leaf| leaf.timestamp() >= max_leaf_timestamp - MAX_PARENT_DELTA)
            .collect();

        if usable.is_empty() {
            if self.storage.get_message_count(&self.id).await? == 0 {
                return Err(Error::NotSynchronized);
            }
            return Err(Error::NoLeaves);
        }

        let height = usable.iter().map(|leaf| leaf.height()).max().unwrap_or(0) + 1;
        let timestamp = timestamp.unwrap_or_else(now_seconds).max(max_leaf_timestamp);
        let parents: Vec<MessageHash> = usable.iter().map(|leaf| *leaf.hash()).collect();

        let content = identity.sign_message_body(
            Body::json(&body).to_proto(),
            self,
            &parents,
            height,
            timestamp,
        )?;
        let message = Message::build(self, content, parents, height)?;

        self.receive_inner(&message).await?;
        self.outgoing_wait.resolve_all(ANY_MESSAGE, message.clone());
        debug!(channel = %self.id, hash = %message.hash(), "posted message");
        Ok(message)
    }

    /// Serve a DAG discovery query.
    pub async fn query(
        &self,
        cursor: Cursor,
        is_backward: bool,
        limit: usize,
    ) -> Result<QueryResult> {
        let limit = limit.min(self.config.max_query_limit);
        let cursor = match cursor {
            Cursor::Height(height) => Cursor::Height(height.min(self.min_leaf_height().await?)),
            hash_cursor => hash_cursor,
        };
        let slice = self.storage.query(&self.id, &cursor, is_backward, limit).await?;
        Ok(QueryResult {
            abbreviated: slice
                .messages
                .iter()
                .map(|message| AbbreviatedEntry {
                    parents: message.parents().to_vec(),
                    hash: *message.hash(),
                })
                .collect(),
            forward_hash: slice.forward_hash,
            backward_hash: slice.backward_hash,
        })
    }

    /// Serve a bulk fetch: the subset of `hashes` present in storage, in
    /// input order, bounded per response.
    pub async fn bulk(&self, hashes: &[MessageHash]) -> Result<BulkResult> {
        let mut messages = Vec::new();
        let mut processed = 0usize;
        for hash in hashes {
            if messages.len() >= MAX_BULK_COUNT {
                break;
            }
            if let Some(message) = self.storage.get_message(&self.id, hash).await? {
                messages.push(message.to_wire());
            }
            processed += 1;
        }
        Ok(BulkResult { messages, forward_index: processed as u32 })
    }

    /// Drive discovery-and-fetch against a remote until both sides agree.
    /// Returns the number of newly accepted messages.
    pub async fn sync(&self, remote: &dyn RemoteChannel) -> Result<usize> {
        let start = Cursor::Height(self.min_leaf_height().await?);
        debug!(channel = %self.id, "sync started");

        let mut received = 0usize;
        let mut unresolved: HashSet<MessageHash> = HashSet::new();
        let mut cursor = start;
        let mut is_full = false;

        loop {
            let is_backward = !unresolved.is_empty();
            let response = remote
                .query(cursor.clone(), is_backward, self.config.max_query_limit as u32)
                .await?;
            if response.abbreviated.len() > self.config.max_query_limit {
                return Err(Error::Ban(BanError::QueryOverflow(response.abbreviated.len())));
            }

            let (to_fetch, external) = self.partition_response(&response).await?;
            if is_full && !external.is_empty() {
                return Err(Error::Ban(BanError::MissingParentInFullSync));
            }

            received += self.fetch_bulk(remote, &to_fetch).await?;

            for entry in &response.abbreviated {
                unresolved.remove(&entry.hash);
            }
            unresolved.extend(external);

            if unresolved.len() > self.config.max_unresolved_count {
                // Adversarial or pathological DAG shape: bound memory by
                // replaying the whole linearization instead.
                debug!(channel = %self.id, unresolved = unresolved.len(), "falling back to full sync");
                unresolved.clear();
                cursor = Cursor::Height(0);
                is_full = true;
                continue;
            }

            if unresolved.is_empty() {
                match response.forward_hash {
                    Some(hash) => cursor = Cursor::Hash(hash),
                    None => break,
                }
            } else {
                match response.backward_hash {
                    Some(hash) => cursor = Cursor::Hash(hash),
                    None => break,
                }
            }
        }

        debug!(channel = %self.id, received, "sync finished");
        Ok(received)
    }

    /// Split a query response into hashes that are fetchable now (every
    /// parent stored or fetchable within this response) and the external
    /// parent hashes that need backward discovery first.
    async fn partition_response(
        &self,
        response: &QueryResult,
    ) -> Result<(Vec<MessageHash>, HashSet<MessageHash>)> {
        let in_response: HashSet<MessageHash> =
            response.abbreviated.iter().map(|entry| entry.hash).collect();
        let mut fetchable: HashSet<MessageHash> = HashSet::new();
        let mut to_fetch = Vec::new();
        let mut external = HashSet::new();

        for entry in &response.abbreviated {
            if self.storage.has_message(&self.id, &entry.hash).await? {
                continue;
            }
            let mut deferred = false;
            for parent in &entry.parents {
                if fetchable.contains(parent)
                    || self.storage.has_message(&self.id, parent).await?
                {
                    continue;
                }
                deferred = true;
                if !in_response.contains(parent) {
                    external.insert(*parent);
                }
            }
            if !deferred && fetchable.insert(entry.hash) {
                to_fetch.push(entry.hash);
            }
        }

        Ok((to_fetch, external))
    }

    /// Fetch `hashes` in bulk batches, decrypt, and accept each message.
    async fn fetch_bulk(
        &self,
        remote: &dyn RemoteChannel,
        hashes: &[MessageHash],
    ) -> Result<usize> {
        let mut received = 0usize;
        let mut offset = 0usize;
        while offset < hashes.len() {
            let response = remote.bulk(&hashes[offset..]).await?;
            for wire in &response.messages {
                let message = Message::decrypt(self, wire)?;
                if self.receive(message).await? {
                    received += 1;
                }
            }
            if response.forward_index == 0 {
                // Empty response (remote timeout); retry on the next
                // synchronize trigger.
                break;
            }
            offset += response.forward_index as usize;
        }
        Ok(received)
    }

    /// Validate, decrypt, and serve an encrypted sync request, producing
    /// the encrypted response envelope.
    pub async fn handle_sync_request(
        &self,
        request: &proto::SyncRequest,
    ) -> Result<proto::SyncResponse> {
        let channel_id = ChannelId::from_slice(&request.channel_id).map_err(Error::Ban)?;
        if channel_id != self.id {
            return Err(Error::Ban(BanError::MalformedPacket(
                "sync request for a different channel".into(),
            )));
        }

        let plaintext = self.decrypt(&request.r#box, &request.nonce)?;
        let content: proto::SyncRequestContent = proto::decode(&plaintext)?;

        if content.timestamp > now_seconds() + FUTURE {
            return Err(Error::Ban(BanError::InvalidTimestamp));
        }
        let leaf_key = self.request_leaf_key(&content)?;
        self.verify_request_signature(&content, &leaf_key)?;

        let response = match &content.content {
            Some(proto::sync_request_content::Content::Query(query)) => {
                let cursor = match &query.cursor {
                    Some(proto::query::Cursor::Height(height)) => {
                        Cursor::Height((*height).max(0) as u64)
                    }
                    Some(proto::query::Cursor::Hash(hash)) => {
                        Cursor::Hash(MessageHash::from_slice(hash).map_err(Error::Ban)?)
                    }
                    None => Cursor::Height(0),
                };
                let result = self
                    .query(cursor, query.is_backward, query.limit as usize)
                    .await?;
                proto::sync_response_content::Content::QueryResponse(result.to_proto())
            }
            Some(proto::sync_request_content::Content::Bulk(bulk)) => {
                let hashes = bulk
                    .hashes
                    .iter()
                    .map(|h| MessageHash::from_slice(h))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(Error::Ban)?;
                let result = self.bulk(&hashes).await?;
                proto::sync_response_content::Content::BulkResponse(proto::BulkResponse {
                    messages: result.messages,
                    forward_index: result.forward_index,
                })
            }
            None => {
                return Err(Error::Ban(BanError::MalformedPacket(
                    "sync request without content".into(),
                )))
            }
        };

        let response_bytes = proto::encode(&proto::SyncResponseContent { content: Some(response) });
        let (nonce, sealed) = self.encrypt(&response_bytes)?;
        let mut boxed = Vec::with_capacity(NONCE_LENGTH + sealed.len());
        boxed.extend_from_slice(&nonce);
        boxed.extend_from_slice(&sealed);

        Ok(proto::SyncResponse {
            channel_id: self.id.as_bytes().to_vec(),
            seq: request.seq,
            r#box: boxed,
        })
    }

    /// Open the encrypted envelope of a sync response.
    pub fn open_sync_response(
        &self,
        response: &proto::SyncResponse,
    ) -> Result<proto::SyncResponseContent> {
        if response.r#box.len() < NONCE_LENGTH {
            return Err(Error::Ban(BanError::InvalidLength {
                field: "sync response box",
                actual: response.r#box.len(),
            }));
        }
        let (nonce, sealed) = response.r#box.split_at(NONCE_LENGTH);
        let plaintext = self.decrypt(sealed, nonce)?;
        proto::decode(&plaintext)
    }

    /// Resolve the key that must have signed a sync request: the leaf of
    /// a valid member chain, the channel key itself for an empty chain
    /// (the owner), or a bare ephemeral key on feeds.
    fn request_leaf_key(&self, content: &proto::SyncRequestContent) -> Result<[u8; PUBLIC_KEY_LENGTH]> {
        if !content.chain.is_empty() {
            let chain = Chain::from_proto(&content.chain)?;
            return chain.verify(&self.public_key, &self.id, content.timestamp);
        }
        if content.public_key.is_empty() {
            // Only the owner's secret key can satisfy this signature.
            return Ok(self.public_key);
        }
        if !self.is_feed {
            return Err(Error::Ban(BanError::InvalidSignature));
        }
        content
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| {
                Error::Ban(BanError::InvalidLength {
                    field: "request public key",
                    actual: content.public_key.len(),
                })
            })
    }

    fn verify_request_signature(
        &self,
        content: &proto::SyncRequestContent,
        leaf_key: &[u8; PUBLIC_KEY_LENGTH],
    ) -> Result<()> {
        let signature_bytes: [u8; SIGNATURE_LENGTH] = content
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| {
                Error::Ban(BanError::InvalidLength {
                    field: "request signature",
                    actual: content.signature.len(),
                })
            })?;
        let mut tbs = content.clone();
        tbs.signature = Vec::new();

        let verifying_key = VerifyingKey::from_bytes(leaf_key)
            .map_err(|_| Error::Ban(BanError::InvalidSignature))?;
        verifying_key
            .verify(&proto::encode(&tbs), &Signature::from_bytes(&signature_bytes))
            .map_err(|_| Error::Ban(BanError::InvalidSignature))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_feed", &self.is_feed)
            .finish()
    }
}
