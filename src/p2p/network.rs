//! TCP peer transport: listener, dialer, handshake, heartbeat, broadcast.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;

use crate::event_bus::{Event, EventBus};

use super::codec::{
    generate_message_id, CodecError, HandshakePayload, HeartbeatPayload, Message, MessageReader,
    MessageWriter, Payload,
};
use super::peer::{run_writer_task, Peer, PeerMetricsSnapshot};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("unexpected message during handshake")]
    UnexpectedHandshakeResponse,
    #[error("peer {0} not connected")]
    PeerNotConnected(String),
    #[error("peer registry is at capacity ({0})")]
    AtCapacity(usize),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Callback into the sync/mesh dispatch layer, injected at construction to
/// break the cyclic dependency between the network (which must invoke sync
/// handlers) and the sync engine (which must send via the network).
pub type MessageHandler = Arc<dyn Fn(String, Message) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct P2pNetwork {
    node_id: String,
    bind_addr: SocketAddr,
    advertise_port: u16,
    max_peers: usize,
    max_message_size: usize,
    heartbeat_interval_secs: u64,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    event_bus: Arc<EventBus>,
    handler: RwLock<Option<MessageHandler>>,
    local_addr: RwLock<Option<SocketAddr>>,
    exit_channel: broadcast::Sender<()>,
}

impl P2pNetwork {
    pub fn new(
        node_id: String,
        bind_addr: SocketAddr,
        advertise_port: u16,
        max_peers: usize,
        max_message_size: usize,
        heartbeat_interval_secs: u64,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (exit_channel, _) = broadcast::channel(1);
        Arc::new(Self {
            node_id,
            bind_addr,
            advertise_port,
            max_peers,
            max_message_size,
            heartbeat_interval_secs,
            peers: RwLock::new(HashMap::new()),
            event_bus,
            handler: RwLock::new(None),
            local_addr: RwLock::new(None),
            exit_channel,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Installs the callback invoked for every non-handshake, non-heartbeat
    /// message received from a peer. Must be called before `start`.
    pub async fn set_handler(&self, handler: MessageHandler) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_metrics(&self, peer_id: &str) -> Option<PeerMetricsSnapshot> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|p| p.metrics().snapshot())
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// The actual bound listener address, including the OS-assigned port
    /// when `bind_addr`'s port was 0. `None` until `start` has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Binds the listener and spawns the accept loop plus the heartbeat
    /// ticker. Returns once the listener is bound so callers know the port
    /// is live before proceeding (e.g. writing the sentinel).
    pub async fn start(self: &Arc<Self>) -> Result<(), P2pError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        *self.local_addr.write().await = Some(listener.local_addr()?);
        let network = Arc::clone(self);
        tokio::spawn(async move { network.accept_loop(listener).await });

        let network = Arc::clone(self);
        tokio::spawn(async move { network.heartbeat_loop().await });

        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.exit_channel.send(());
        let peer_ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        for id in peer_ids {
            self.remove_peer(&id).await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut exit = self.exit_channel.subscribe();
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                accepted = listener.accept() => {
                    let (stream, address) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let network = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = network.handle_inbound(stream, address).await {
                            log::debug!("inbound handshake with {} failed: {}", address, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_inbound(
        self: &Arc<Self>,
        stream: TcpStream,
        address: SocketAddr,
    ) -> Result<(), P2pError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half, self.max_message_size);
        let mut writer = MessageWriter::new(write_half);

        let (message, _) = timeout(HANDSHAKE_TIMEOUT, reader.read_message())
            .await
            .map_err(|_| P2pError::HandshakeTimeout)?
            .map_err(P2pError::Codec)?
            .ok_or(P2pError::UnexpectedHandshakeResponse)?;

        let remote = match message.payload {
            Payload::Handshake(h) => h,
            _ => return Err(P2pError::UnexpectedHandshakeResponse),
        };

        let reply = Message::new(
            self.node_id.clone(),
            remote.node_id.clone(),
            Payload::Handshake(HandshakePayload {
                node_id: self.node_id.clone(),
                listen_port: self.advertise_port,
            }),
        );
        writer.write_message(&reply).await?;

        self.register_peer(remote.node_id, address, remote.listen_port, reader, writer)
            .await
    }

    /// Dials `address`, performs the symmetric handshake, and registers the
    /// resulting peer on success.
    pub async fn dial(self: &Arc<Self>, address: SocketAddr) -> Result<String, P2pError> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| P2pError::HandshakeTimeout)??;
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half, self.max_message_size);
        let mut writer = MessageWriter::new(write_half);

        let handshake = Message::new(
            self.node_id.clone(),
            String::new(),
            Payload::Handshake(HandshakePayload {
                node_id: self.node_id.clone(),
                listen_port: self.advertise_port,
            }),
        );
        writer.write_message(&handshake).await?;

        let (message, _) = timeout(HANDSHAKE_TIMEOUT, reader.read_message())
            .await
            .map_err(|_| P2pError::HandshakeTimeout)?
            .map_err(P2pError::Codec)?
            .ok_or(P2pError::UnexpectedHandshakeResponse)?;

        let remote = match message.payload {
            Payload::Handshake(h) => h,
            _ => return Err(P2pError::UnexpectedHandshakeResponse),
        };
        let remote_id = remote.node_id.clone();

        self.register_peer(remote.node_id, address, remote.listen_port, reader, writer)
            .await?;
        Ok(remote_id)
    }

    async fn register_peer(
        self: &Arc<Self>,
        peer_id: String,
        address: SocketAddr,
        listen_port: u16,
        reader: MessageReader,
        writer: MessageWriter,
    ) -> Result<(), P2pError> {
        {
            let peers = self.peers.read().await;
            if peers.len() >= self.max_peers {
                return Err(P2pError::AtCapacity(self.max_peers));
            }
            if peers.contains_key(&peer_id) {
                return Ok(());
            }
        }

        let (peer, rx) = Peer::new(peer_id.clone(), address, listen_port);
        self.peers.write().await.insert(peer_id.clone(), Arc::clone(&peer));

        let exit = peer.get_exit_receiver();
        tokio::spawn(run_writer_task(Arc::clone(&peer), rx, writer, exit));

        let network = Arc::clone(self);
        let peer_for_loop = Arc::clone(&peer);
        tokio::spawn(async move {
            network.receive_loop(peer_for_loop, reader).await;
        });

        self.event_bus.publish(Event::PeerConnected {
            peer_id,
            address,
        });
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, peer: Arc<Peer>, mut reader: MessageReader) {
        let mut exit = peer.get_exit_receiver();
        loop {
            let next = tokio::select! {
                _ = exit.recv() => break,
                next = reader.read_message() => next,
            };
            match next {
                Ok(Some((message, bytes))) => {
                    peer.touch();
                    peer.metrics()
                        .bytes_received
                        .fetch_add(bytes as u64, std::sync::atomic::Ordering::Relaxed);
                    peer.metrics()
                        .messages_received
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.dispatch(&peer, message).await;
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("decode error from {}: {}", peer, e);
                    break;
                }
            }
        }
        self.remove_peer(peer.id()).await;
    }

    async fn dispatch(&self, peer: &Arc<Peer>, message: Message) {
        match &message.payload {
            Payload::Heartbeat(_) => {
                let reply = Message::new(
                    self.node_id.clone(),
                    peer.id().to_string(),
                    Payload::Heartbeat(HeartbeatPayload {
                        timestamp: chrono::Utc::now(),
                    }),
                );
                let _ = peer.send(reply).await;
            }
            _ => {
                if let Some(handler) = self.handler.read().await.as_ref() {
                    handler(peer.id().to_string(), message).await;
                }
            }
        }
    }

    async fn remove_peer(&self, peer_id: &str) {
        let removed = self.peers.write().await.remove(peer_id);
        if let Some(peer) = removed {
            peer.signal_exit().await;
            self.event_bus.publish(Event::PeerDisconnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Sends `payload` to a specific connected peer.
    pub async fn send_to(&self, peer_id: &str, payload: Payload) -> Result<(), P2pError> {
        let peer = {
            let peers = self.peers.read().await;
            peers
                .get(peer_id)
                .cloned()
                .ok_or_else(|| P2pError::PeerNotConnected(peer_id.to_string()))?
        };
        let message = Message::new(self.node_id.clone(), peer_id.to_string(), payload);
        peer.send(message)
            .await
            .map_err(|e| P2pError::SendFailed(e.to_string()))
    }

    /// Enumerates the peer list under a read lock, then sends to each
    /// outside the lock, per the shared-resource policy.
    pub async fn broadcast(&self, build_payload: impl Fn() -> Payload) -> usize {
        let peers: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        let mut attempted = 0;
        for peer in peers {
            attempted += 1;
            let message = Message::new(self.node_id.clone(), peer.id().to_string(), build_payload());
            if let Err(e) = peer.send(message).await {
                log::warn!("broadcast to {} failed: {}", peer, e);
            }
        }
        attempted
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.heartbeat_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.broadcast(|| Payload::Heartbeat(HeartbeatPayload { timestamp: chrono::Utc::now() })).await;
                }
            }
        }
    }
}

pub fn new_message_id() -> String {
    generate_message_id()
}
