//! LAN discovery: UDP broadcast announcements plus an auto-connect task
//! that promotes discovered peers to direct P2P connections.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;

use crate::p2p::P2pNetwork;

const ANNOUNCE_INTERVAL_SECS: u64 = 60;
const AUTO_CONNECT_INTERVAL_SECS: u64 = 30;
const RECV_DEADLINE: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_SIZE: usize = 1024;
const STALE_AFTER_SECS: i64 = 5 * 60;
const EVICT_AFTER_SECS: i64 = 10 * 60;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed announcement: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A LAN discovery announcement. Single UDP datagram, JSON-encoded, capped
/// at `MAX_DATAGRAM_SIZE` bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: String,
    pub port: u16,
    pub repositories: Vec<String>,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub address: SocketAddr,
    pub port: u16,
    pub repositories: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

/// Fixed list of well-known LAN broadcast addresses, tried in addition to
/// whatever a best-effort local-subnet guess produces.
fn well_known_broadcast_addresses(port: u16) -> Vec<SocketAddr> {
    [
        Ipv4Addr::new(255, 255, 255, 255),
        Ipv4Addr::new(192, 168, 0, 255),
        Ipv4Addr::new(192, 168, 1, 255),
        Ipv4Addr::new(10, 0, 0, 255),
    ]
    .into_iter()
    .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, port)))
    .collect()
}

/// Best-effort guess at this host's local /24 broadcast address, derived
/// from whichever interface the OS would route an outbound packet through.
/// No interface-enumeration crate is in this crate's dependency stack, so
/// unlike a full implementation this does not walk every interface; it is
/// a deliberate simplification recorded in DESIGN.md.
fn local_subnet_broadcast(port: u16) -> Option<SocketAddr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:80").ok()?;
    let local_addr = probe.local_addr().ok()?;
    match local_addr.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_loopback() => {
            let octets = ip.octets();
            let broadcast = Ipv4Addr::new(octets[0], octets[1], octets[2], 255);
            Some(SocketAddr::V4(SocketAddrV4::new(broadcast, port)))
        }
        _ => None,
    }
}

/// UDP-based LAN discovery service.
pub struct Discovery {
    node_id: String,
    listen_port: u16,
    discovery_port: u16,
    socket: Arc<UdpSocket>,
    peers: RwLock<HashMap<String, DiscoveredPeer>>,
    repositories: RwLock<Vec<String>>,
    exit_channel: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Discovery {
    pub async fn bind(
        node_id: String,
        listen_port: u16,
        discovery_bind_addr: SocketAddr,
    ) -> Result<Arc<Self>, DiscoveryError> {
        let socket = UdpSocket::bind(discovery_bind_addr).await?;
        socket.set_broadcast(true)?;
        let (exit_channel, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            node_id,
            listen_port,
            discovery_port: discovery_bind_addr.port(),
            socket: Arc::new(socket),
            peers: RwLock::new(HashMap::new()),
            repositories: RwLock::new(Vec::new()),
            exit_channel,
            running: AtomicBool::new(false),
        }))
    }

    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn set_repositories(&self, repositories: Vec<String>) {
        *self.repositories.write().await = repositories;
    }

    /// Starts the receive loop, the periodic announce task, and the
    /// auto-connect task. Idempotent.
    pub fn start(self: &Arc<Self>, network: Arc<P2pNetwork>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let receiver = Arc::clone(self);
        tokio::spawn(async move { receiver.receive_loop().await });

        let announcer = Arc::clone(self);
        tokio::spawn(async move { announcer.announce_loop().await });

        let connector = Arc::clone(self);
        tokio::spawn(async move { connector.auto_connect_loop(network).await });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.exit_channel.send(());
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            if exit.try_recv().is_ok() {
                break;
            }
            let recv = timeout(RECV_DEADLINE, self.socket.recv_from(&mut buf)).await;
            let (len, source) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    log::warn!("discovery recv error: {}", e);
                    continue;
                }
                Err(_) => continue,
            };
            let announcement: Announcement = match serde_json::from_slice(&buf[..len]) {
                Ok(a) => a,
                Err(e) => {
                    log::debug!("dropping malformed discovery announcement: {}", e);
                    continue;
                }
            };
            if announcement.node_id == self.node_id {
                continue;
            }
            let address = SocketAddr::new(source.ip(), announcement.port);
            let peer = DiscoveredPeer {
                node_id: announcement.node_id.clone(),
                address,
                port: announcement.port,
                repositories: announcement.repositories,
                last_seen: Utc::now(),
            };
            self.peers.write().await.insert(announcement.node_id, peer);
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(ANNOUNCE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.announce().await;
                }
            }
        }
    }

    async fn announce(&self) {
        let announcement = Announcement {
            node_id: self.node_id.clone(),
            port: self.listen_port,
            repositories: self.repositories.read().await.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        };
        let bytes = match serde_json::to_vec(&announcement) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("failed to encode discovery announcement: {}", e);
                return;
            }
        };
        let mut targets = well_known_broadcast_addresses(self.discovery_port);
        if let Some(guessed) = local_subnet_broadcast(self.discovery_port) {
            targets.push(guessed);
        }
        for target in targets {
            if let Err(e) = self.socket.send_to(&bytes, target).await {
                log::debug!("discovery announce to {} failed: {}", target, e);
            }
        }
    }

    async fn auto_connect_loop(self: Arc<Self>, network: Arc<P2pNetwork>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(AUTO_CONNECT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.auto_connect(&network).await;
                    self.evict_stale().await;
                }
            }
        }
    }

    async fn auto_connect(&self, network: &Arc<P2pNetwork>) {
        let now = Utc::now();
        let candidates: Vec<DiscoveredPeer> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| (now - p.last_seen).num_seconds() < STALE_AFTER_SECS)
            .cloned()
            .collect();
        for candidate in candidates {
            if network.is_connected(&candidate.node_id).await {
                continue;
            }
            if let Err(e) = network.dial(candidate.address).await {
                log::debug!("auto-connect to {} failed: {}", candidate.address, e);
            }
        }
    }

    async fn evict_stale(&self) {
        let now = Utc::now();
        self.peers
            .write()
            .await
            .retain(|_, p| (now - p.last_seen).num_seconds() < EVICT_AFTER_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn own_announcement_is_dropped() {
        let discovery = Discovery::bind(
            "self-id".into(),
            9090,
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        let discovery_addr = discovery.socket.local_addr().unwrap();

        let receiver = Arc::clone(&discovery);
        tokio::spawn(async move { receiver.receive_loop().await });

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let own = Announcement {
            node_id: "self-id".into(),
            port: 9090,
            repositories: vec![],
            version: "0".into(),
            timestamp: Utc::now(),
        };
        sender
            .send_to(&serde_json::to_vec(&own).unwrap(), discovery_addr)
            .await
            .unwrap();

        let other = Announcement {
            node_id: "peer-id".into(),
            port: 9091,
            repositories: vec![],
            version: "0".into(),
            timestamp: Utc::now(),
        };
        sender
            .send_to(&serde_json::to_vec(&other).unwrap(), discovery_addr)
            .await
            .unwrap();

        // give the receive loop time to drain both datagrams
        tokio::time::sleep(Duration::from_millis(200)).await;

        let peers = discovery.discovered_peers().await;
        assert!(
            peers.iter().all(|p| p.node_id != "self-id"),
            "self announcement should never be recorded as a discovered peer"
        );
        assert!(
            peers.iter().any(|p| p.node_id == "peer-id"),
            "a genuinely distinct peer announcement should still be recorded"
        );

        discovery.stop();
    }

    #[tokio::test]
    async fn stale_peers_are_evicted() {
        let discovery = Discovery::bind(
            "self-id".into(),
            9090,
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        discovery.peers.write().await.insert(
            "stale".into(),
            DiscoveredPeer {
                node_id: "stale".into(),
                address: "127.0.0.1:1234".parse().unwrap(),
                port: 1234,
                repositories: vec![],
                last_seen: Utc::now() - chrono::Duration::seconds(EVICT_AFTER_SECS + 1),
            },
        );
        discovery.evict_stale().await;
        assert!(discovery.discovered_peers().await.is_empty());
    }
}
