//! Two-replica synchronization and convergence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core_channel::{
    AbbreviatedEntry, Body, BulkResult, Channel, QueryResult, RemoteChannel,
};
use crate::core_store::Cursor;
use crate::error::{BanError, Error, Result};
use crate::test_utils::{identity_with_channel, join_via_invite, DirectRemote};
use crate::types::MessageHash;

async fn assert_converged(a: &Channel, b: &Channel) {
    let count = a.message_count().await.unwrap();
    assert_eq!(count, b.message_count().await.unwrap());
    for offset in 0..count {
        let ours = a.message_at_offset(offset).await.unwrap().unwrap();
        let theirs = b.message_at_offset(offset).await.unwrap().unwrap();
        assert_eq!(ours.hash(), theirs.hash(), "divergence at offset {}", offset);
    }
}

#[tokio::test]
async fn test_invite_grants_chain_of_length_one() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    let (bob, bob_channel) = join_via_invite(&alice, &alice_channel, "bob").await;

    assert_eq!(bob_channel.id(), alice_channel.id());
    let chain = bob.chain_for(bob_channel.id()).unwrap();
    assert_eq!(chain.len(), 1);
    let leaf = chain
        .verify(
            bob_channel.public_key(),
            bob_channel.id(),
            crate::types::now_seconds(),
        )
        .unwrap();
    assert_eq!(leaf, *bob.public_key());
}

#[tokio::test]
async fn test_gossip_delivers_post() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    alice_channel
        .post(serde_json::json!({"text": "ohai"}), &alice, None)
        .await
        .unwrap();

    let (_bob, bob_channel) = join_via_invite(&alice, &alice_channel, "bob").await;
    let received = bob_channel
        .sync(&DirectRemote::new(alice_channel.clone()))
        .await
        .unwrap();

    assert_eq!(received, 2);
    assert_eq!(bob_channel.message_count().await.unwrap(), 2);
    let post = bob_channel.message_at_offset(1).await.unwrap().unwrap();
    assert_eq!(post.body(), &Body::Json("{\"text\":\"ohai\"}".into()));
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    alice_channel
        .post(serde_json::json!({"n": 1}), &alice, None)
        .await
        .unwrap();

    let (_bob, bob_channel) = join_via_invite(&alice, &alice_channel, "bob").await;
    let remote = DirectRemote::new(alice_channel.clone());
    assert_eq!(bob_channel.sync(&remote).await.unwrap(), 2);
    assert_eq!(bob_channel.sync(&remote).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_posts_converge() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    let (bob, bob_channel) = join_via_invite(&alice, &alice_channel, "bob").await;
    bob_channel
        .sync(&DirectRemote::new(alice_channel.clone()))
        .await
        .unwrap();

    // Divergent posts on both replicas with only the root in common.
    alice_channel
        .post(serde_json::json!({"from": "alice"}), &alice, None)
        .await
        .unwrap();
    bob_channel
        .post(serde_json::json!({"from": "bob"}), &bob, None)
        .await
        .unwrap();

    bob_channel
        .sync(&DirectRemote::new(alice_channel.clone()))
        .await
        .unwrap();
    alice_channel
        .sync(&DirectRemote::new(bob_channel.clone()))
        .await
        .unwrap();

    assert_eq!(alice_channel.message_count().await.unwrap(), 3);
    assert_converged(&alice_channel, &bob_channel).await;

    // Both posts are siblings at height one.
    for offset in 1..3 {
        let message = alice_channel.message_at_offset(offset).await.unwrap().unwrap();
        assert_eq!(message.height(), 1);
    }
}

#[tokio::test]
async fn test_sync_paginates_bulk_batches() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    // More messages than fit in a single bulk response.
    for n in 0..140 {
        alice_channel
            .post(serde_json::json!({ "n": n }), &alice, None)
            .await
            .unwrap();
    }

    let (_bob, bob_channel) = join_via_invite(&alice, &alice_channel, "bob").await;
    let received = bob_channel
        .sync(&DirectRemote::new(alice_channel.clone()))
        .await
        .unwrap();

    assert_eq!(received, 141);
    assert_converged(&alice_channel, &bob_channel).await;
}

struct OversizedRemote;

#[async_trait]
impl RemoteChannel for OversizedRemote {
    async fn query(&self, _: Cursor, _: bool, limit: u32) -> Result<QueryResult> {
        let abbreviated = (0..limit as usize + 1)
            .map(|n| {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&(n as u32).to_be_bytes());
                AbbreviatedEntry { parents: Vec::new(), hash: MessageHash::from_bytes(bytes) }
            })
            .collect();
        Ok(QueryResult { abbreviated, forward_hash: None, backward_hash: None })
    }

    async fn bulk(&self, _: &[MessageHash]) -> Result<BulkResult> {
        Ok(BulkResult::default())
    }
}

#[tokio::test]
async fn test_oversized_query_response_is_banned() {
    let (_, channel, _) = identity_with_channel("alice").await;
    let err = channel.sync(&OversizedRemote).await.unwrap_err();
    assert!(matches!(err, Error::Ban(BanError::QueryOverflow(_))));
}

/// Delegates to a real channel but corrupts every bulk payload.
struct TamperingRemote {
    inner: DirectRemote,
}

#[async_trait]
impl RemoteChannel for TamperingRemote {
    async fn query(&self, cursor: Cursor, is_backward: bool, limit: u32) -> Result<QueryResult> {
        self.inner.query(cursor, is_backward, limit).await
    }

    async fn bulk(&self, hashes: &[MessageHash]) -> Result<BulkResult> {
        let mut result = self.inner.bulk(hashes).await?;
        for message in &mut result.messages {
            if let Some(byte) = message.encrypted_content.first_mut() {
                *byte ^= 0xff;
            }
        }
        Ok(result)
    }
}

#[tokio::test]
async fn test_tampered_bulk_message_is_banned() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    alice_channel
        .post(serde_json::json!({"n": 1}), &alice, None)
        .await
        .unwrap();

    let (_bob, bob_channel) = join_via_invite(&alice, &alice_channel, "bob").await;
    let remote = TamperingRemote { inner: DirectRemote::new(alice_channel.clone()) };
    let err = bob_channel.sync(&remote).await.unwrap_err();
    assert!(matches!(err, Error::Ban(BanError::DecryptionFailed)));
    assert_eq!(bob_channel.message_count().await.unwrap(), 0);
}

/// First answers with unresolvable parents to overflow the unresolved
/// set, then serves the real linearization.
struct OverflowingRemote {
    inner: DirectRemote,
    poisoned: AtomicBool,
}

#[async_trait]
impl RemoteChannel for OverflowingRemote {
    async fn query(&self, cursor: Cursor, is_backward: bool, limit: u32) -> Result<QueryResult> {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            let abbreviated = (0..4u32)
                .map(|n| {
                    let mut hash = [0xeeu8; 32];
                    hash[..4].copy_from_slice(&n.to_be_bytes());
                    let mut parent = [0xddu8; 32];
                    parent[..4].copy_from_slice(&n.to_be_bytes());
                    AbbreviatedEntry {
                        parents: vec![MessageHash::from_bytes(parent)],
                        hash: MessageHash::from_bytes(hash),
                    }
                })
                .collect();
            return Ok(QueryResult {
                abbreviated,
                forward_hash: None,
                backward_hash: None,
            });
        }
        self.inner.query(cursor, is_backward, limit).await
    }

    async fn bulk(&self, hashes: &[MessageHash]) -> Result<BulkResult> {
        self.inner.bulk(hashes).await
    }
}

#[tokio::test]
async fn test_unresolved_overflow_falls_back_to_full_sync() {
    let (alice, alice_channel, _) = identity_with_channel("alice").await;
    for n in 0..3 {
        alice_channel
            .post(serde_json::json!({ "n": n }), &alice, None)
            .await
            .unwrap();
    }

    // A receiving replica with the overflow bound shrunk so four junk
    // parents trigger the fallback.
    let mut config = crate::test_utils::test_config();
    config.max_unresolved_count = 2;
    let bob_channel = Arc::new(
        Channel::new(
            *alice_channel.public_key(),
            alice_channel.name(),
            false,
            None,
            Arc::new(crate::core_store::MemoryStorage::new()),
            config,
        )
        .unwrap(),
    );

    let remote = OverflowingRemote {
        inner: DirectRemote::new(alice_channel.clone()),
        poisoned: AtomicBool::new(false),
    };
    let received = bob_channel.sync(&remote).await.unwrap();

    // Full replay delivers exactly what linear replay would have.
    assert_eq!(received, alice_channel.message_count().await.unwrap());
    assert_converged(&alice_channel, &bob_channel).await;
}
