//! A connected peer: registry entry, metrics, and the serialized writer
//! side of its connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};

use super::codec::{Message, MessageWriter};

/// Bound on the per-peer outbound queue; a peer slow enough to fill this
/// backs up its own writer task, which is the intended backpressure point.
const WRITER_CHANNEL_CAPACITY: usize = 256;

pub type Tx = mpsc::Sender<Message>;

/// Byte/message counters, split out so they can be read without holding the
/// peer lock (the registry-level `RwLock` guards insertion/removal, not
/// these counters).
#[derive(Default)]
pub struct PeerMetrics {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
}

impl PeerMetrics {
    pub fn snapshot(&self) -> PeerMetricsSnapshot {
        PeerMetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerMetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// A registered peer. One instance per connected node, keyed in the
/// network's peer registry by `id`.
pub struct Peer {
    id: String,
    address: SocketAddr,
    listen_port: u16,
    metrics: PeerMetrics,
    last_seen: AtomicI64,
    tx: Tx,
    exit_channel: broadcast::Sender<()>,
}

impl Peer {
    pub fn new(id: String, address: SocketAddr, listen_port: u16) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (exit_channel, _) = broadcast::channel(1);
        let peer = Arc::new(Self {
            id,
            address,
            listen_port,
            metrics: PeerMetrics::default(),
            last_seen: AtomicI64::new(Utc::now().timestamp()),
            tx,
            exit_channel,
        });
        (peer, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn metrics(&self) -> &PeerMetrics {
        &self.metrics
    }

    pub fn touch(&self) {
        self.last_seen.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_seen_unix(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn get_exit_receiver(&self) -> broadcast::Receiver<()> {
        self.exit_channel.subscribe()
    }

    pub async fn signal_exit(&self) {
        let _ = self.exit_channel.send(());
    }

    /// Enqueue a message for the writer task. Never blocks the caller beyond
    /// ordinary channel backpressure; the actual socket write happens on the
    /// dedicated writer task so only one task ever writes to this peer's
    /// socket at a time.
    pub async fn send(&self, message: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.tx.send(message).await
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer[{}@{}]", self.id, self.address)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Drains `rx` and writes each message through `writer`, incrementing byte
/// counters as it goes. Exits when the channel closes or the exit signal
/// fires, whichever comes first.
pub async fn run_writer_task(
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<Message>,
    mut writer: MessageWriter,
    mut exit: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = exit.recv() => break,
            maybe_message = rx.recv() => {
                let message = match maybe_message {
                    Some(m) => m,
                    None => break,
                };
                match writer.write_message(&message).await {
                    Ok(bytes) => {
                        peer.metrics.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                        peer.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::warn!("failed to write to {}: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_id_only() {
        let (p1, _rx1) = Peer::new("a".into(), "127.0.0.1:1".parse().unwrap(), 1);
        let (p2, _rx2) = Peer::new("a".into(), "127.0.0.1:2".parse().unwrap(), 2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn metrics_start_at_zero() {
        let (peer, _rx) = Peer::new("a".into(), "127.0.0.1:1".parse().unwrap(), 1);
        let snap = peer.metrics().snapshot();
        assert_eq!(snap.bytes_sent, 0);
        assert_eq!(snap.messages_received, 0);
    }
}
