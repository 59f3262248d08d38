//! Sync agent state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core_channel::{BulkResult, Channel, QueryResult, RemoteChannel};
use crate::core_identity::Identity;
use crate::core_store::Cursor;
use crate::error::{BanError, Error, Result};
use crate::proto;
use crate::types::{now_seconds, MessageHash};

/// How a sync agent signs its request envelopes.
pub enum AgentSigner {
    /// A member identity holding a chain for the channel.
    Member(Arc<Identity>),
    /// Feed channels: a fresh ephemeral key per sync run, so the
    /// requester never reveals its real public key.
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RequestKind {
    Query,
    Bulk,
}

impl RequestKind {
    fn name(&self) -> &'static str {
        match self {
            RequestKind::Query => "query",
            RequestKind::Bulk => "bulk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AgentState {
    Idle,
    Active,
    Pending,
}

struct PendingRequest {
    kind: RequestKind,
    tx: oneshot::Sender<proto::SyncResponseContent>,
}

/// Synchronization client for one channel over one peer session.
///
/// `synchronize` coalesces: a trigger while a run is active marks the
/// agent pending and the run restarts exactly once when it finishes;
/// further triggers while pending are absorbed.
pub struct SyncAgent {
    channel: Arc<Channel>,
    signer: AgentSigner,
    outgoing: mpsc::Sender<proto::Packet>,
    seq: AtomicU32,
    state: Mutex<AgentState>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    ephemeral: Mutex<Option<SigningKey>>,
    destroyed: AtomicBool,
    sync_timeout: Duration,
}

impl SyncAgent {
    pub fn new(
        channel: Arc<Channel>,
        signer: AgentSigner,
        outgoing: mpsc::Sender<proto::Packet>,
    ) -> Arc<Self> {
        let sync_timeout = channel.config().sync_timeout;
        Arc::new(Self {
            channel,
            signer,
            outgoing,
            seq: AtomicU32::new(0),
            state: Mutex::new(AgentState::Idle),
            pending: Mutex::new(HashMap::new()),
            ephemeral: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            sync_timeout,
        })
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Run the channel sync loop, coalescing concurrent triggers.
    ///
    /// Ban errors propagate so the peer session can terminate; transient
    /// errors are absorbed and retried on the next trigger.
    pub async fn synchronize(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                AgentState::Idle => *state = AgentState::Active,
                AgentState::Active => {
                    *state = AgentState::Pending;
                    return Ok(());
                }
                AgentState::Pending => return Ok(()),
            }
        }

        loop {
            if self.destroyed.load(Ordering::Acquire) {
                *self.state.lock().expect("state lock poisoned") = AgentState::Idle;
                return Ok(());
            }
            if matches!(self.signer, AgentSigner::Ephemeral) {
                *self.ephemeral.lock().expect("ephemeral lock poisoned") =
                    Some(SigningKey::generate(&mut OsRng));
            }

            let run = self.channel.sync(self.as_ref()).await;
            match run {
                Ok(count) => {
                    if count > 0 {
                        debug!(channel = %self.channel.id(), count, "sync run received messages");
                    }
                }
                Err(err) if err.is_ban() => {
                    *self.state.lock().expect("state lock poisoned") = AgentState::Idle;
                    return Err(err);
                }
                Err(Error::Closed) => {
                    *self.state.lock().expect("state lock poisoned") = AgentState::Idle;
                    return Ok(());
                }
                Err(err) => {
                    warn!(channel = %self.channel.id(), %err, "sync run failed, will retry");
                }
            }

            let restart = {
                let mut state = self.state.lock().expect("state lock poisoned");
                if *state == AgentState::Pending {
                    *state = AgentState::Active;
                    true
                } else {
                    *state = AgentState::Idle;
                    false
                }
            };
            if !restart {
                return Ok(());
            }
        }
    }

    /// Route a response from the peer loop to its pending request.
    ///
    /// Unknown seq and response-type mismatches are ban-worthy protocol
    /// violations.
    pub fn handle_response(&self, response: &proto::SyncResponse) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&response.seq)
            .ok_or(Error::Ban(BanError::UnexpectedSeq(response.seq)))?;

        let content = self.channel.open_sync_response(response)?;
        let matches_kind = matches!(
            (&pending.kind, &content.content),
            (
                RequestKind::Query,
                Some(proto::sync_response_content::Content::QueryResponse(_))
            ) | (
                RequestKind::Bulk,
                Some(proto::sync_response_content::Content::BulkResponse(_))
            )
        );
        if !matches_kind {
            return Err(Error::Ban(BanError::UnexpectedResponseType {
                expected: pending.kind.name(),
            }));
        }
        // The waiter may have timed out already; that is not an error.
        let _ = pending.tx.send(content);
        Ok(())
    }

    /// Fail all in-flight requests and reject future ones.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.pending.lock().expect("pending lock poisoned").clear();
    }

    /// Fill in the sender fields and sign the request content. The
    /// signature covers the encoding with the signature field cleared.
    fn sign_request(&self, content: &mut proto::SyncRequestContent) -> Result<()> {
        match &self.signer {
            AgentSigner::Member(identity) => {
                let chain = identity
                    .chain_for(self.channel.id())
                    .ok_or_else(|| Error::NoChain(self.channel.name().to_string()))?;
                content.chain = chain.to_proto();
                content.signature = identity.sign(&proto::encode(content))?;
            }
            AgentSigner::Ephemeral => {
                let guard = self.ephemeral.lock().expect("ephemeral lock poisoned");
                let key = guard.as_ref().ok_or(Error::Closed)?;
                content.public_key = key.verifying_key().to_bytes().to_vec();
                content.signature = key.sign(&proto::encode(content)).to_bytes().to_vec();
            }
        }
        Ok(())
    }

    /// Issue one encrypted request and await its decrypted response.
    /// Resolves `None` on timeout; the remote may simply be slow.
    async fn request(
        &self,
        kind: RequestKind,
        inner: proto::sync_request_content::Content,
    ) -> Result<Option<proto::SyncResponseContent>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut content = proto::SyncRequestContent {
            chain: Vec::new(),
            public_key: Vec::new(),
            timestamp: now_seconds(),
            signature: Vec::new(),
            content: Some(inner),
        };
        self.sign_request(&mut content)?;

        let (nonce, sealed) = self.channel.encrypt(&proto::encode(&content))?;
        let request = proto::SyncRequest {
            channel_id: self.channel.id().as_bytes().to_vec(),
            seq,
            nonce: nonce.to_vec(),
            r#box: sealed,
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(seq, PendingRequest { kind, tx });

        let packet = proto::Packet {
            content: Some(proto::packet::Content::SyncRequest(request)),
        };
        if self.outgoing.send(packet).await.is_err() {
            self.pending.lock().expect("pending lock poisoned").remove(&seq);
            return Err(Error::Closed);
        }

        match timeout(self.sync_timeout, rx).await {
            Ok(Ok(content)) => Ok(Some(content)),
            // Destroyed while waiting.
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.pending.lock().expect("pending lock poisoned").remove(&seq);
                debug!(channel = %self.channel.id(), seq, kind = kind.name(), "request timed out");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RemoteChannel for SyncAgent {
    // The wire-backed remote: requests travel as encrypted SyncRequest
    // packets, responses come back through `handle_response`.
    async fn query(&self, cursor: Cursor, is_backward: bool, limit: u32) -> Result<QueryResult> {
        let cursor = match cursor {
            Cursor::Height(height) => proto::query::Cursor::Height(height as i64),
            Cursor::Hash(hash) => proto::query::Cursor::Hash(hash.as_bytes().to_vec()),
        };
        let query = proto::Query {
            cursor: Some(cursor),
            is_backward,
            limit,
        };
        let response = self
            .request(
                RequestKind::Query,
                proto::sync_request_content::Content::Query(query),
            )
            .await?;
        match response.and_then(|content| content.content) {
            Some(proto::sync_response_content::Content::QueryResponse(inner)) => {
                QueryResult::from_proto(&inner)
            }
            _ => Ok(QueryResult::default()),
        }
    }

    async fn bulk(&self, hashes: &[MessageHash]) -> Result<BulkResult> {
        let bulk = proto::Bulk {
            hashes: hashes.iter().map(|h| h.as_bytes().to_vec()).collect(),
        };
        let response = self
            .request(
                RequestKind::Bulk,
                proto::sync_request_content::Content::Bulk(bulk),
            )
            .await?;
        match response.and_then(|content| content.content) {
            Some(proto::sync_response_content::Content::BulkResponse(inner)) => Ok(BulkResult {
                messages: inner.messages,
                forward_index: inner.forward_index,
            }),
            _ => Ok(BulkResult::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::identity_with_channel;

    /// Agent wired straight back to its own channel's service side:
    /// every outgoing request is served locally and the response routed
    /// through `handle_response`.
    async fn loopback_agent() -> (Arc<SyncAgent>, Arc<Channel>) {
        let (identity, channel, _) = identity_with_channel("a").await;
        let (tx, mut rx) = mpsc::channel(16);
        let agent = SyncAgent::new(channel.clone(), AgentSigner::Member(identity), tx);

        let service_agent = agent.clone();
        let service_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Some(proto::packet::Content::SyncRequest(request)) = packet.content {
                    let response = service_channel
                        .handle_sync_request(&request)
                        .await
                        .expect("service side");
                    service_agent.handle_response(&response).expect("routing");
                }
            }
        });
        (agent, channel)
    }

    #[tokio::test]
    async fn test_query_roundtrip_through_envelope() {
        let (agent, channel) = loopback_agent().await;
        let result = agent.query(Cursor::Height(0), false, 10).await.unwrap();
        assert_eq!(result.abbreviated.len(), 1);
        let root = channel.message_at_offset(0).await.unwrap().unwrap();
        assert_eq!(result.abbreviated[0].hash, *root.hash());
    }

    #[tokio::test]
    async fn test_bulk_roundtrip_through_envelope() {
        let (agent, channel) = loopback_agent().await;
        let root = channel.message_at_offset(0).await.unwrap().unwrap();
        let result = agent.bulk(&[*root.hash()]).await.unwrap();
        assert_eq!(result.forward_index, 1);
        assert_eq!(result.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_seq_wraps_around() {
        let (agent, _) = loopback_agent().await;
        agent.seq.store(u32::MAX, Ordering::Relaxed);
        // Both the wrapping request and the next one must match.
        agent.query(Cursor::Height(0), false, 1).await.unwrap();
        agent.query(Cursor::Height(0), false, 1).await.unwrap();
        assert_eq!(agent.seq.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_seq_is_banned() {
        let (agent, channel) = loopback_agent().await;
        let response = proto::SyncResponse {
            channel_id: channel.id().as_bytes().to_vec(),
            seq: 999,
            r#box: vec![0u8; 40],
        };
        let err = agent.handle_response(&response).unwrap_err();
        assert!(matches!(err, Error::Ban(BanError::UnexpectedSeq(999))));
    }

    #[tokio::test]
    async fn test_timeout_resolves_as_empty_response() {
        let (identity, channel, _) = identity_with_channel("a").await;
        // No service side: requests go nowhere and time out.
        let (tx, _rx) = mpsc::channel(16);
        let agent = SyncAgent::new(channel, AgentSigner::Member(identity), tx);

        let result = agent.query(Cursor::Height(0), false, 10).await.unwrap();
        assert!(result.abbreviated.is_empty());
        assert!(result.forward_hash.is_none());
        // The timed-out request no longer matches.
        assert!(agent.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_fails_inflight_requests() {
        let (identity, channel, _) = identity_with_channel("a").await;
        let (tx, _rx) = mpsc::channel(16);
        let agent = SyncAgent::new(channel, AgentSigner::Member(identity), tx);

        let inflight = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.query(Cursor::Height(0), false, 10).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.destroy();

        let result = inflight.await.unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_synchronize_on_synced_channel_is_quiet() {
        let (agent, channel) = loopback_agent().await;
        agent.synchronize().await.unwrap();
        assert_eq!(channel.message_count().await.unwrap(), 1);
        assert_eq!(
            *agent.state.lock().unwrap(),
            AgentState::Idle,
            "agent must return to idle"
        );
    }
}
