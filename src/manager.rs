//! `P2pManager`: the single outward-facing façade over the network, sync
//! engine, mesh overlay, and LAN discovery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::P2PConfig;
use crate::discovery::Discovery;
use crate::error::CoreError;
use crate::event_bus::EventBus;
use crate::mesh::MeshOverlay;
use crate::p2p::{Message, P2pNetwork, Payload};
use crate::sentinel::{Sentinel, SentinelKind, SentinelState};
use crate::storage::{Storage, TimelineManager};
use crate::sync::SyncEngine;

#[derive(Clone, Debug, Serialize)]
pub struct PeerCounts {
    pub direct: usize,
    pub known_via_mesh: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncTotals {
    pub conflicts: u64,
    pub bytes_transferred: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Status {
    pub node_id: String,
    pub running: bool,
    pub peers: PeerCounts,
    pub sync: SyncTotals,
    pub port: u16,
    pub discovery_port: u16,
}

/// Composes every subsystem behind one lifecycle. Holding this alone is
/// enough to run a fully participating mesh node.
pub struct P2pManager {
    node_id: String,
    config: P2PConfig,
    event_bus: Arc<EventBus>,
    network: Arc<P2pNetwork>,
    sync_engine: Arc<SyncEngine>,
    mesh: Arc<MeshOverlay>,
    discovery: Arc<RwLock<Option<Arc<Discovery>>>>,
    p2p_sentinel: Sentinel,
    mesh_sentinel: Sentinel,
    running: AtomicBool,
}

impl P2pManager {
    pub async fn new(
        node_id: String,
        config: P2PConfig,
        data_dir: impl AsRef<std::path::Path>,
        storage: Arc<dyn Storage>,
        timelines: Arc<dyn TimelineManager>,
    ) -> Arc<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let event_bus = Arc::new(EventBus::new());

        let bind_addr: SocketAddr = config.p2p_bind_address();
        let network = P2pNetwork::new(
            node_id.clone(),
            bind_addr,
            config.port,
            config.max_peers,
            config.max_message_size,
            config.heartbeat_interval_secs,
            Arc::clone(&event_bus),
        );

        let sync_engine = SyncEngine::new(
            storage,
            timelines,
            Arc::clone(&network),
            Arc::clone(&event_bus),
            config.auto_sync_enabled,
            config.sync_interval_secs,
            config.max_concurrent_sync,
        );

        let self_address = bind_addr.to_string();
        let mesh = MeshOverlay::new(
            node_id.clone(),
            self_address,
            Arc::clone(&network),
            Arc::clone(&event_bus),
        );

        Arc::new(Self {
            node_id,
            config,
            event_bus,
            network,
            sync_engine,
            mesh,
            discovery: Arc::new(RwLock::new(None)),
            p2p_sentinel: Sentinel::new(&data_dir, SentinelKind::P2p),
            mesh_sentinel: Sentinel::new(&data_dir, SentinelKind::Mesh),
            running: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The listener's actual bound address, including the OS-assigned port
    /// when the configured port was 0. `None` before `start` has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.network.local_addr().await
    }

    /// Dials another manager directly, bypassing discovery. Useful for
    /// tests and for wiring known peers outside of LAN discovery.
    pub async fn dial(&self, address: SocketAddr) -> Result<String, CoreError> {
        Ok(self.network.dial(address).await?)
    }

    /// Consults the sentinel, then brings up event bus, network, sync
    /// engine, and discovery in order, dials every configured known peer,
    /// and writes the sentinel last.
    pub async fn start(self: &Arc<Self>, repositories: Vec<String>) -> Result<(), CoreError> {
        if let Some(state) = self.p2p_sentinel.load().await? {
            if state.running {
                return Err(CoreError::AlreadyRunning(state.pid));
            }
        }

        self.event_bus.start().await;

        self.install_dispatcher().await;
        self.network.start().await?;

        self.sync_engine.start().await;
        self.mesh.start().await;

        let discovery = Discovery::bind(
            self.node_id.clone(),
            self.config.port,
            self.config.discovery_bind_address(),
        )
        .await?;
        discovery.set_repositories(repositories).await;
        discovery.start(Arc::clone(&self.network));
        *self.discovery.write().await = Some(discovery);

        for known_peer in &self.config.known_peers {
            match known_peer.parse::<SocketAddr>() {
                Ok(address) => {
                    if let Err(e) = self.network.dial(address).await {
                        log::warn!("failed to dial known peer {}: {}", known_peer, e);
                    }
                }
                Err(e) => log::warn!("invalid known peer address {}: {}", known_peer, e),
            }
        }

        self.running.store(true, Ordering::SeqCst);
        self.write_sentinels().await?;
        Ok(())
    }

    /// Installs the combined dispatcher that routes every non-heartbeat
    /// message to either the sync engine or the mesh overlay, resolving the
    /// single-handler-slot constraint described in the network module.
    async fn install_dispatcher(&self) {
        let sync_engine = Arc::clone(&self.sync_engine);
        let mesh = Arc::clone(&self.mesh);
        self.network
            .set_handler(Arc::new(move |peer_id: String, message: Message| {
                let sync_engine = Arc::clone(&sync_engine);
                let mesh = Arc::clone(&mesh);
                Box::pin(async move {
                    match &message.payload {
                        Payload::MeshTopology(_) | Payload::MeshTopologyRequest(_) => {
                            mesh.handle_message(peer_id, message).await;
                        }
                        _ => {
                            sync_engine.handle_message(peer_id, message).await;
                        }
                    }
                })
            }))
            .await;
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        if let Some(discovery) = self.discovery.write().await.take() {
            discovery.stop();
        }
        self.mesh.stop();
        self.sync_engine.stop();
        self.network.stop().await;
        self.event_bus.stop().await;

        self.running.store(false, Ordering::SeqCst);
        self.p2p_sentinel.clear().await?;
        self.mesh_sentinel.clear().await?;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return true;
        }
        self.p2p_sentinel.is_running().await.unwrap_or(false)
    }

    /// Snapshot of everything the mesh overlay currently believes about
    /// reachable peers, direct or otherwise.
    pub async fn mesh_topology(&self) -> Vec<crate::mesh::MeshPeer> {
        self.mesh.topology_snapshot().await
    }

    /// The overlay's current computed next-hop routes, keyed by peer id.
    pub async fn mesh_routes(&self) -> std::collections::HashMap<String, Vec<String>> {
        self.mesh.routes_snapshot().await
    }

    /// Sends a mesh-level ping to `target`, routed through the overlay if
    /// it is not a direct peer.
    pub async fn ping_mesh(&self, target: &str) {
        self.mesh.ping(target).await;
    }

    /// Forces an immediate topology gossip round and route recomputation,
    /// without waiting for the overlay's periodic ticker.
    pub async fn mesh_gossip_now(&self) {
        self.mesh.gossip_now().await;
    }

    /// Runs one healing pass immediately.
    pub async fn mesh_heal_now(&self) {
        self.mesh.heal_now().await;
    }

    pub async fn status(&self) -> Status {
        let direct = self.network.peer_count().await;
        let topology = self.mesh.topology_snapshot().await;
        let known_via_mesh = topology.len().saturating_sub(1).saturating_sub(direct);

        let mut conflicts = 0u64;
        let mut bytes_transferred = 0u64;
        for peer_id in self.network.peer_ids().await {
            if let Some(state) = self.sync_engine.peer_state(&peer_id).await {
                conflicts += state.conflict_count;
                bytes_transferred += state.bytes_transferred;
            }
        }

        Status {
            node_id: self.node_id.clone(),
            running: self.is_running().await,
            peers: PeerCounts {
                direct,
                known_via_mesh,
            },
            sync: SyncTotals {
                conflicts,
                bytes_transferred,
            },
            port: self.config.port,
            discovery_port: self.config.discovery_port,
        }
    }

    async fn write_sentinels(&self) -> Result<(), CoreError> {
        let pid = std::process::id();
        let started_at = chrono::Utc::now();

        self.p2p_sentinel
            .write(&SentinelState {
                running: true,
                node_id: self.node_id.clone(),
                port: self.config.port,
                discovery_port: self.config.discovery_port,
                started_at,
                pid,
            })
            .await?;
        self.mesh_sentinel
            .write(&SentinelState {
                running: true,
                node_id: self.node_id.clone(),
                port: self.config.port,
                discovery_port: self.config.discovery_port,
                started_at,
                pid,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::model::{Blob, Seal, Tree, TimelineMetadata};
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct InMemoryStorage {
        seals: Mutex<HashMap<Hash, Seal>>,
        trees: Mutex<HashMap<Hash, Tree>>,
        blobs: Mutex<HashMap<Hash, Blob>>,
    }

    impl InMemoryStorage {
        fn new() -> Self {
            Self {
                seals: Mutex::new(HashMap::new()),
                trees: Mutex::new(HashMap::new()),
                blobs: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Storage for InMemoryStorage {
        async fn load_seal(&self, hash: &Hash) -> Result<Option<Seal>, StorageError> {
            Ok(self.seals.lock().await.get(hash).cloned())
        }
        async fn store_seal(&self, seal: Seal) -> Result<(), StorageError> {
            self.seals.lock().await.insert(seal.hash(), seal);
            Ok(())
        }
        async fn load_tree(&self, hash: &Hash) -> Result<Option<Tree>, StorageError> {
            Ok(self.trees.lock().await.get(hash).cloned())
        }
        async fn store_tree(&self, hash: Hash, tree: Tree) -> Result<(), StorageError> {
            self.trees.lock().await.insert(hash, tree);
            Ok(())
        }
        async fn load_blob(&self, hash: &Hash) -> Result<Option<Blob>, StorageError> {
            Ok(self.blobs.lock().await.get(hash).cloned())
        }
        async fn store_blob(&self, hash: Hash, blob: Blob) -> Result<(), StorageError> {
            self.blobs.lock().await.insert(hash, blob);
            Ok(())
        }
        async fn has_object(&self, hash: &Hash) -> Result<bool, StorageError> {
            Ok(self.seals.lock().await.contains_key(hash))
        }
        async fn list_seals(&self, _timeline: &str, _limit: usize) -> Result<Vec<Seal>, StorageError> {
            Ok(Vec::new())
        }
    }

    struct InMemoryTimelines {
        heads: Mutex<HashMap<String, Hash>>,
        current: Mutex<String>,
    }

    impl InMemoryTimelines {
        fn new() -> Self {
            Self {
                heads: Mutex::new(HashMap::new()),
                current: Mutex::new("main".to_string()),
            }
        }
    }

    #[async_trait]
    impl TimelineManager for InMemoryTimelines {
        async fn current(&self) -> Result<String, StorageError> {
            Ok(self.current.lock().await.clone())
        }
        async fn get_head(&self, timeline: &str) -> Result<Option<Hash>, StorageError> {
            Ok(self.heads.lock().await.get(timeline).copied())
        }
        async fn update_head(&self, timeline: &str, head: Hash) -> Result<(), StorageError> {
            self.heads.lock().await.insert(timeline.to_string(), head);
            Ok(())
        }
        async fn delete_timeline(&self, timeline: &str) -> Result<(), StorageError> {
            self.heads.lock().await.remove(timeline);
            Ok(())
        }
        async fn create(&self, timeline: &str, head: Hash) -> Result<(), StorageError> {
            self.heads.lock().await.insert(timeline.to_string(), head);
            Ok(())
        }
        async fn switch(&self, timeline: &str) -> Result<(), StorageError> {
            *self.current.lock().await = timeline.to_string();
            Ok(())
        }
        async fn list_timelines(&self) -> Result<Vec<String>, StorageError> {
            Ok(self.heads.lock().await.keys().cloned().collect())
        }
        async fn get_timeline_metadata(
            &self,
            _timeline: &str,
        ) -> Result<Option<TimelineMetadata>, StorageError> {
            Ok(None)
        }
    }

    async fn test_manager(dir: &std::path::Path) -> Arc<P2pManager> {
        let mut config = P2PConfig::default();
        config.port = 0;
        config.discovery_port = 0;
        P2pManager::new(
            "node-under-test".into(),
            config,
            dir,
            Arc::new(InMemoryStorage::new()),
            Arc::new(InMemoryTimelines::new()),
        )
        .await
    }

    #[tokio::test]
    async fn starts_and_stops_cleanly() {
        let dir = tempdir::TempDir::new("ivaldi-manager").unwrap();
        let manager = test_manager(dir.path()).await;
        manager.start(vec![]).await.unwrap();
        assert!(manager.is_running().await);
        manager.stop().await.unwrap();
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn refuses_to_start_when_sentinel_shows_live_pid() {
        let dir = tempdir::TempDir::new("ivaldi-manager").unwrap();
        let sentinel = Sentinel::new(dir.path(), SentinelKind::P2p);
        sentinel
            .write(&SentinelState {
                running: true,
                node_id: "other".into(),
                port: 9090,
                discovery_port: 9091,
                started_at: chrono::Utc::now(),
                pid: std::process::id(),
            })
            .await
            .unwrap();

        let manager = test_manager(dir.path()).await;
        let result = manager.start(vec![]).await;
        assert!(matches!(result, Err(CoreError::AlreadyRunning(_))));
    }
}
