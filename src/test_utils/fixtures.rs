//! Factory functions for common test objects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ProtocolConfig;
use crate::core_channel::{BulkResult, Channel, QueryResult, RemoteChannel};
use crate::core_identity::{Chain, Identity};
use crate::core_store::{Cursor, MemoryStorage};
use crate::error::Result;
use crate::types::{MessageHash, PeerId};

/// Config with a short request deadline so timeout paths finish quickly.
pub fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        sync_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// An identity with its freshly created channel on its own storage.
pub async fn identity_with_channel(name: &str) -> (Arc<Identity>, Arc<Channel>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let identity = Arc::new(Identity::new(name));
    let channel = Arc::new(
        Channel::create(&identity, name, storage.clone(), test_config())
            .await
            .expect("channel creation"),
    );
    (identity, channel, storage)
}

/// Run the invite flow: `owner` invites a fresh identity, which builds
/// its own channel replica (empty until synced) on separate storage.
pub async fn join_via_invite(
    owner: &Identity,
    owner_channel: &Channel,
    member_name: &str,
) -> (Arc<Identity>, Arc<Channel>) {
    let member = Arc::new(Identity::new(member_name));
    let (request, invite_box) = member.request_invite(&PeerId::from_bytes([0u8; 32]));
    let (encrypted, _) = owner
        .issue_invite(owner_channel, &request, member_name)
        .expect("invite issuance");
    let invite = invite_box.decrypt(&encrypted).expect("invite decryption");

    let storage = Arc::new(MemoryStorage::new());
    let public_key: [u8; 32] = invite.channel_pub_key.as_slice().try_into().unwrap();
    let channel = Arc::new(
        Channel::new(
            public_key,
            &invite.channel_name,
            false,
            None,
            storage,
            test_config(),
        )
        .expect("channel construction"),
    );
    member.add_chain(&channel, Chain::from_proto(&invite.chain).expect("chain"));
    (member, channel)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Remote end served directly by another in-process channel, bypassing
/// sockets and envelopes.
pub struct DirectRemote {
    channel: Arc<Channel>,
}

impl DirectRemote {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl RemoteChannel for DirectRemote {
    async fn query(&self, cursor: Cursor, is_backward: bool, limit: u32) -> Result<QueryResult> {
        self.channel.query(cursor, is_backward, limit as usize).await
    }

    async fn bulk(&self, hashes: &[MessageHash]) -> Result<BulkResult> {
        self.channel.bulk(hashes).await
    }
}
