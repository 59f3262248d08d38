//! In-memory reference storage.
//!
//! Reference implementation for the ordering semantics of the storage
//! interface; also the backend used throughout the test suite.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::constants::MAX_LEAVES_COUNT;
use crate::core_channel::Message;
use crate::error::Result;
use crate::types::{ChannelId, MessageHash};

use super::traits::{Cursor, QuerySlice, Storage};

#[derive(Default)]
struct ChannelData {
    /// CRDT linearization: keys sorted by `(height, hash)`.
    order: Vec<(u64, MessageHash)>,
    by_hash: HashMap<MessageHash, Message>,
    leaves: HashSet<MessageHash>,
}

impl ChannelData {
    fn index_of(&self, hash: &MessageHash) -> Option<usize> {
        let message = self.by_hash.get(hash)?;
        let key = (message.height(), *hash);
        self.order.binary_search(&key).ok()
    }
}

/// In-memory [`Storage`] implementation.
#[derive(Default)]
pub struct MemoryStorage {
    channels: RwLock<HashMap<ChannelId, ChannelData>>,
    entities: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add_message(&self, message: Message) -> Result<bool> {
        let mut channels = self.channels.write().await;
        let data = channels.entry(*message.channel_id()).or_default();

        let hash = *message.hash();
        if data.by_hash.contains_key(&hash) {
            return Ok(false);
        }

        for parent in message.parents() {
            data.leaves.remove(parent);
        }
        data.leaves.insert(hash);

        let key = (message.height(), hash);
        let position = data.order.partition_point(|entry| *entry < key);
        data.order.insert(position, key);
        data.by_hash.insert(hash, message);
        Ok(true)
    }

    async fn get_message_count(&self, channel_id: &ChannelId) -> Result<usize> {
        let channels = self.channels.read().await;
        Ok(channels.get(channel_id).map_or(0, |data| data.order.len()))
    }

    async fn has_message(&self, channel_id: &ChannelId, hash: &MessageHash) -> Result<bool> {
        let channels = self.channels.read().await;
        Ok(channels
            .get(channel_id)
            .is_some_and(|data| data.by_hash.contains_key(hash)))
    }

    async fn get_message(
        &self,
        channel_id: &ChannelId,
        hash: &MessageHash,
    ) -> Result<Option<Message>> {
        let channels = self.channels.read().await;
        Ok(channels
            .get(channel_id)
            .and_then(|data| data.by_hash.get(hash).cloned()))
    }

    async fn get_messages(
        &self,
        channel_id: &ChannelId,
        hashes: &[MessageHash],
    ) -> Result<Vec<Option<Message>>> {
        let channels = self.channels.read().await;
        let data = channels.get(channel_id);
        Ok(hashes
            .iter()
            .map(|hash| data.and_then(|d| d.by_hash.get(hash).cloned()))
            .collect())
    }

    async fn get_message_at_offset(
        &self,
        channel_id: &ChannelId,
        offset: usize,
    ) -> Result<Option<Message>> {
        let channels = self.channels.read().await;
        Ok(channels.get(channel_id).and_then(|data| {
            data.order
                .get(offset)
                .and_then(|(_, hash)| data.by_hash.get(hash).cloned())
        }))
    }

    async fn get_leaves(&self, channel_id: &ChannelId) -> Result<Vec<Message>> {
        let channels = self.channels.read().await;
        let Some(data) = channels.get(channel_id) else {
            return Ok(Vec::new());
        };
        let mut leaves: Vec<Message> = data
            .leaves
            .iter()
            .filter_map(|hash| data.by_hash.get(hash).cloned())
            .collect();
        leaves.sort_by_key(|message| (message.height(), *message.hash()));
        leaves.truncate(MAX_LEAVES_COUNT);
        Ok(leaves)
    }

    async fn query(
        &self,
        channel_id: &ChannelId,
        cursor: &Cursor,
        is_backward: bool,
        limit: usize,
    ) -> Result<QuerySlice> {
        let channels = self.channels.read().await;
        let Some(data) = channels.get(channel_id) else {
            return Ok(QuerySlice::default());
        };

        let index = match cursor {
            Cursor::Height(height) => data
                .order
                .partition_point(|(entry_height, _)| *entry_height < *height),
            Cursor::Hash(hash) => match data.index_of(hash) {
                Some(index) => index,
                // Unknown hash: be lenient, the remote may be ahead of us.
                None => return Ok(QuerySlice::default()),
            },
        };

        let (start, end) = if is_backward {
            (index.saturating_sub(limit), index)
        } else {
            (index, (index + limit).min(data.order.len()))
        };

        let messages: Vec<Message> = data.order[start..end]
            .iter()
            .filter_map(|(_, hash)| data.by_hash.get(hash).cloned())
            .collect();

        let forward_hash = data.order.get(end).map(|(_, hash)| *hash);
        let backward_hash = if start > 0 && start < end {
            Some(data.order[start].1)
        } else {
            None
        };

        Ok(QuerySlice { messages, forward_hash, backward_hash })
    }

    async fn remove_channel_messages(&self, channel_id: &ChannelId) -> Result<()> {
        self.channels.write().await.remove(channel_id);
        Ok(())
    }

    async fn store_entity(&self, prefix: &str, id: &str, blob: Vec<u8>) -> Result<()> {
        let mut entities = self.entities.write().await;
        entities
            .entry(prefix.to_string())
            .or_default()
            .insert(id.to_string(), blob);
        Ok(())
    }

    async fn retrieve_entity(&self, prefix: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let entities = self.entities.read().await;
        Ok(entities.get(prefix).and_then(|bucket| bucket.get(id).cloned()))
    }

    async fn remove_entity(&self, prefix: &str, id: &str) -> Result<()> {
        let mut entities = self.entities.write().await;
        if let Some(bucket) = entities.get_mut(prefix) {
            bucket.remove(id);
        }
        Ok(())
    }

    async fn get_entity_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entities = self.entities.read().await;
        Ok(entities
            .get(prefix)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entity_roundtrip() {
        let storage = MemoryStorage::new();
        storage
            .store_entity("channel", "abcd", vec![1, 2, 3])
            .await
            .unwrap();

        let blob = storage.retrieve_entity("channel", "abcd").await.unwrap();
        assert_eq!(blob, Some(vec![1, 2, 3]));

        let keys = storage.get_entity_keys("channel").await.unwrap();
        assert_eq!(keys, vec!["abcd".to_string()]);

        storage.remove_entity("channel", "abcd").await.unwrap();
        assert_eq!(storage.retrieve_entity("channel", "abcd").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_channel_is_empty() {
        let storage = MemoryStorage::new();
        let channel_id = ChannelId::from_bytes([1u8; 32]);
        assert_eq!(storage.get_message_count(&channel_id).await.unwrap(), 0);
        assert!(storage.get_leaves(&channel_id).await.unwrap().is_empty());
        let slice = storage
            .query(&channel_id, &Cursor::Height(0), false, 10)
            .await
            .unwrap();
        assert!(slice.messages.is_empty());
        assert!(slice.forward_hash.is_none());
    }
}
