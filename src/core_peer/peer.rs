//! Peer sessions.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::constants::{MAX_ERROR_REASON_LEN, VERSION};
use crate::core_channel::Channel;
use crate::core_sync::{AgentSigner, SyncAgent};
use crate::error::{BanError, Error, Result};
use crate::proto::{self, framing};
use crate::protocol::WaitList;
use crate::types::{ChannelId, PeerId};

/// Queue depth for outgoing packets before senders back off.
const OUTGOING_QUEUE: usize = 64;

type PacketSink<T> = SplitSink<Framed<T, LengthDelimitedCodec>, bytes::Bytes>;
type PacketStream<T> = SplitStream<Framed<T, LengthDelimitedCodec>>;

/// One peer session over an established socket.
pub struct Peer {
    local_id: PeerId,
    remote_id: PeerId,
    config: ProtocolConfig,
    outgoing: mpsc::Sender<proto::Packet>,
    agents: RwLock<HashMap<ChannelId, Arc<SyncAgent>>>,
    invite_wait: Arc<WaitList<proto::EncryptedInvite>>,
    ping_wait: WaitList<()>,
    ping_seq: AtomicU32,
    close_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl Peer {
    /// Exchange hello frames over `socket` and construct the session.
    ///
    /// Both sides send their hello before reading, so the exchange never
    /// deadlocks. The remote is rejected on a version other than 1 or a
    /// peer id that is not 32 bytes.
    pub async fn handshake<T>(
        socket: T,
        local_id: PeerId,
        config: ProtocolConfig,
        invite_wait: Arc<WaitList<proto::EncryptedInvite>>,
    ) -> Result<(Arc<Peer>, PeerSession<T>)>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = framing::framed(socket, config.max_frame_length);
        let (mut sink, mut stream) = framed.split();

        let hello = proto::Hello {
            version: VERSION,
            peer_id: local_id.as_bytes().to_vec(),
        };
        sink.send(bytes::Bytes::from(proto::encode(&hello))).await?;

        let frame = stream
            .next()
            .await
            .ok_or(Error::Closed)?
            .map_err(Error::from)?;
        let remote_hello: proto::Hello = proto::decode(&frame)?;
        if remote_hello.version != VERSION {
            return Err(Error::Ban(BanError::UnsupportedVersion(remote_hello.version)));
        }
        let remote_id = PeerId::from_slice(&remote_hello.peer_id).map_err(Error::Ban)?;

        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);

        let peer = Arc::new(Peer {
            local_id,
            remote_id,
            config,
            outgoing,
            agents: RwLock::new(HashMap::new()),
            invite_wait,
            ping_wait: WaitList::new(),
            ping_seq: AtomicU32::new(0),
            close_tx,
            shutdown_tx,
        });

        let writer = tokio::spawn(Self::write_loop(
            sink,
            outgoing_rx,
            peer.shutdown_tx.subscribe(),
        ));

        if let Some(interval) = peer.config.ping_interval {
            let probe = peer.clone();
            let mut shutdown = peer.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if probe.ping().await.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            });
        }
        debug!(local = %peer.local_id, remote = %peer.remote_id, "peer session established");

        let session = PeerSession {
            peer: peer.clone(),
            stream,
            writer,
            close_rx,
        };
        Ok((peer, session))
    }

    /// Drain outgoing packets to the socket in queue order. On shutdown,
    /// flush whatever is already queued (the final Error packet included)
    /// before closing the sink.
    async fn write_loop<T>(
        mut sink: PacketSink<T>,
        mut rx: mpsc::Receiver<proto::Packet>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        if sink.send(framing::encode_packet(&packet)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(packet) = rx.try_recv() {
                        if sink.send(framing::encode_packet(&packet)).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    /// Queue a packet for the remote, preserving call order.
    pub async fn send(&self, packet: proto::Packet) -> Result<()> {
        self.outgoing.send(packet).await.map_err(|_| Error::Closed)
    }

    /// Relay an encrypted invite to this peer.
    pub async fn send_invite(&self, invite: proto::EncryptedInvite) -> Result<()> {
        self.send(proto::Packet {
            content: Some(proto::packet::Content::Invite(invite)),
        })
        .await
    }

    /// Subscribe this session to a channel: create its sync agent, start
    /// notification fan-out, and trigger an initial synchronization.
    pub async fn track_channel(self: &Arc<Self>, channel: Arc<Channel>, signer: AgentSigner) {
        let agent = SyncAgent::new(channel.clone(), signer, self.outgoing.clone());
        self.agents.write().await.insert(*channel.id(), agent.clone());

        // Forward local channel updates as notifications until shutdown.
        let mut updates = channel.subscribe_updates();
        let mut shutdown = self.shutdown_tx.subscribe();
        let channel_id = *channel.id();
        let peer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            let packet = proto::Packet {
                                content: Some(proto::packet::Content::Notification(
                                    proto::Notification {
                                        channel_id: channel_id.as_bytes().to_vec(),
                                    },
                                )),
                            };
                            if peer.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = agent.synchronize().await {
                peer.ban(&err).await;
            }
        });
    }

    /// Whether this session is subscribed to `channel_id`.
    pub async fn is_subscribed(&self, channel_id: &ChannelId) -> bool {
        self.agents.read().await.contains_key(channel_id)
    }

    /// Probe liveness; resolves when the matching pong arrives.
    pub async fn ping(&self) -> Result<()> {
        let seq = self
            .ping_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let waiter = self.ping_wait.wait_for(&seq.to_string());
        self.send(proto::Packet {
            content: Some(proto::packet::Content::Ping(proto::Ping { seq })),
        })
        .await?;
        tokio::time::timeout(self.config.sync_timeout, waiter.wait())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Terminate the session with a reason.
    pub async fn destroy(&self, reason: &str) {
        let _ = self.close_tx.send(reason.to_string()).await;
    }

    async fn ban(&self, err: &Error) {
        warn!(remote = %self.remote_id, %err, "banning peer");
        self.destroy(&err.to_string()).await;
    }

    /// Dispatch one incoming packet.
    async fn handle_packet(self: &Arc<Self>, packet: proto::Packet) -> Result<()> {
        match packet.content {
            None => Err(Error::Ban(BanError::MalformedPacket("empty packet".into()))),
            Some(proto::packet::Content::Error(remote_error)) => {
                info!(remote = %self.remote_id, reason = %remote_error.reason, "remote closed session");
                Err(Error::Closed)
            }
            Some(proto::packet::Content::Invite(invite)) => {
                let request_id = hex::encode(&invite.request_id);
                if self.invite_wait.resolve_all(&request_id, invite) == 0 {
                    debug!(remote = %self.remote_id, request_id, "dropping unrequested invite");
                }
                Ok(())
            }
            Some(proto::packet::Content::SyncRequest(request)) => {
                let channel_id = ChannelId::from_slice(&request.channel_id).map_err(Error::Ban)?;
                let agent = self.agents.read().await.get(&channel_id).cloned();
                match agent {
                    Some(agent) => {
                        let response = agent.channel().handle_sync_request(&request).await?;
                        self.send(proto::Packet {
                            content: Some(proto::packet::Content::SyncResponse(response)),
                        })
                        .await
                    }
                    // Not a violation: the remote may know channels we
                    // have not joined.
                    None => Ok(()),
                }
            }
            Some(proto::packet::Content::SyncResponse(response)) => {
                let channel_id = ChannelId::from_slice(&response.channel_id).map_err(Error::Ban)?;
                let agent = self.agents.read().await.get(&channel_id).cloned();
                match agent {
                    Some(agent) => agent.handle_response(&response),
                    None => Ok(()),
                }
            }
            Some(proto::packet::Content::Notification(notification)) => {
                let channel_id =
                    ChannelId::from_slice(&notification.channel_id).map_err(Error::Ban)?;
                if let Some(agent) = self.agents.read().await.get(&channel_id).cloned() {
                    let peer = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = agent.synchronize().await {
                            peer.ban(&err).await;
                        }
                    });
                }
                Ok(())
            }
            Some(proto::packet::Content::Ping(ping)) => {
                self.send(proto::Packet {
                    content: Some(proto::packet::Content::Pong(proto::Pong { seq: ping.seq })),
                })
                .await
            }
            Some(proto::packet::Content::Pong(pong)) => {
                self.ping_wait.resolve_all(&pong.seq.to_string(), ());
                Ok(())
            }
        }
    }

    /// Tear down tasks, agents, and pending waiters.
    async fn cleanup(&self) {
        let _ = self.shutdown_tx.send(true);
        self.ping_wait.close();
        for agent in self.agents.write().await.values() {
            agent.destroy();
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

/// The running half of a peer session: owns the read loop.
pub struct PeerSession<T> {
    peer: Arc<Peer>,
    stream: PacketStream<T>,
    writer: JoinHandle<()>,
    close_rx: mpsc::Receiver<String>,
}

impl<T> PeerSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Process packets until the socket closes, the remote errors, a ban
    /// fires, or [`Peer::destroy`] is called. Returns the close reason,
    /// if the session ended abnormally.
    pub async fn run(mut self) -> Option<String> {
        let reason = loop {
            tokio::select! {
                reason = self.close_rx.recv() => {
                    break reason;
                }
                frame = self.stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => break Some(err.to_string()),
                        None => break None,
                    };
                    let packet = match framing::decode_packet(&frame) {
                        Ok(packet) => packet,
                        Err(err) => break Some(err.to_string()),
                    };
                    match self.peer.handle_packet(packet).await {
                        Ok(()) => {}
                        Err(Error::Closed) => break None,
                        Err(err) if err.is_ban() => break Some(err.to_string()),
                        Err(err) => {
                            // Transient failure; the session survives.
                            debug!(remote = %self.peer.remote_id, %err, "packet handling failed");
                        }
                    }
                }
            }
        };

        if let Some(reason) = &reason {
            let mut truncated = reason.clone();
            if truncated.len() > MAX_ERROR_REASON_LEN {
                let mut cut = MAX_ERROR_REASON_LEN;
                while !truncated.is_char_boundary(cut) {
                    cut -= 1;
                }
                truncated.truncate(cut);
            }
            let _ = self
                .peer
                .send(proto::Packet {
                    content: Some(proto::packet::Content::Error(proto::PacketError {
                        reason: truncated,
                    })),
                })
                .await;
        }

        self.peer.cleanup().await;
        let _ = self.writer.await;
        reason
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}
