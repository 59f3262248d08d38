//! Storage interface.

use async_trait::async_trait;

use crate::core_channel::Message;
use crate::error::Result;
use crate::types::{ChannelId, MessageHash};

/// Position in a channel's CRDT linearization.
#[derive(Debug, Clone, PartialEq)]
pub enum Cursor {
    /// First message at or above this height.
    Height(u64),
    /// The message with this hash; unknown hashes yield an empty slice.
    Hash(MessageHash),
}

/// Slice of the linearization returned by [`Storage::query`].
#[derive(Debug, Clone, Default)]
pub struct QuerySlice {
    /// Messages in `(height ASC, hash ASC)` order.
    pub messages: Vec<Message>,
    /// Hash of the message immediately after the slice, if any.
    pub forward_hash: Option<MessageHash>,
    /// Hash of the first returned message unless the slice starts at
    /// offset zero.
    pub backward_hash: Option<MessageHash>,
}

/// Per-channel ordered message store plus an entity blob store.
///
/// Implementations must keep, per channel: all known messages indexed by
/// hash and ordered by `(height ASC, hash ASC)`, and the leaf set (hashes
/// that appear in no stored message's parent list). Channels with
/// distinct ids never share state; no cross-channel transactions are
/// required.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a message. Idempotent on hash; returns `false` for a
    /// duplicate. Updates the leaf set.
    async fn add_message(&self, message: Message) -> Result<bool>;

    /// Number of stored messages for the channel.
    async fn get_message_count(&self, channel_id: &ChannelId) -> Result<usize>;

    /// Whether a message with this hash is stored.
    async fn has_message(&self, channel_id: &ChannelId, hash: &MessageHash) -> Result<bool>;

    /// Fetch one message by hash.
    async fn get_message(
        &self,
        channel_id: &ChannelId,
        hash: &MessageHash,
    ) -> Result<Option<Message>>;

    /// Fetch several messages by hash, order preserved.
    async fn get_messages(
        &self,
        channel_id: &ChannelId,
        hashes: &[MessageHash],
    ) -> Result<Vec<Option<Message>>>;

    /// Message at `offset` in the CRDT linearization.
    async fn get_message_at_offset(
        &self,
        channel_id: &ChannelId,
        offset: usize,
    ) -> Result<Option<Message>>;

    /// Current leaves in `(height ASC, hash ASC)` order, bounded by
    /// [`crate::constants::MAX_LEAVES_COUNT`].
    async fn get_leaves(&self, channel_id: &ChannelId) -> Result<Vec<Message>>;

    /// Slice the linearization around `cursor`.
    async fn query(
        &self,
        channel_id: &ChannelId,
        cursor: &Cursor,
        is_backward: bool,
        limit: usize,
    ) -> Result<QuerySlice>;

    /// Drop every message of the channel.
    async fn remove_channel_messages(&self, channel_id: &ChannelId) -> Result<()>;

    /// Store an opaque entity blob under `(prefix, id)`.
    async fn store_entity(&self, prefix: &str, id: &str, blob: Vec<u8>) -> Result<()>;

    /// Fetch an entity blob.
    async fn retrieve_entity(&self, prefix: &str, id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove an entity blob.
    async fn remove_entity(&self, prefix: &str, id: &str) -> Result<()>;

    /// All entity ids stored under `prefix`.
    async fn get_entity_keys(&self, prefix: &str) -> Result<Vec<String>>;
}
