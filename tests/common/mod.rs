//! Shared in-memory `Storage`/`TimelineManager` fixtures for integration
//! scenarios. Not a test file itself — named `mod.rs` so cargo doesn't treat
//! it as its own test binary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ivaldi_sync::config::P2PConfig;
use ivaldi_sync::hash::{Hash, Hashable};
use ivaldi_sync::manager::P2pManager;
use ivaldi_sync::model::{Blob, Identity, Seal, TimelineMetadata, Tree};
use ivaldi_sync::storage::{Storage, StorageError, TimelineManager};
use tokio::sync::Mutex;

pub struct InMemoryStorage {
    seals: Mutex<HashMap<Hash, Seal>>,
    trees: Mutex<HashMap<Hash, Tree>>,
    blobs: Mutex<HashMap<Hash, Blob>>,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seals: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn seal_count(&self) -> usize {
        self.seals.lock().await.len()
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
    async fn list_seals(&self, timeline: &str, limit: usize) -> Result<Vec<Seal>, StorageError> {
        let mut seals: Vec<Seal> = self
            .seals
            .lock()
            .await
            .values()
            .filter(|s| s.name == timeline)
            .cloned()
            .collect();
        seals.sort_by_key(|s| std::cmp::Reverse(s.iteration));
        seals.truncate(limit);
        Ok(seals)
    }
}

pub struct InMemoryTimelines {
    heads: Mutex<HashMap<String, Hash>>,
    current: Mutex<String>,
}

impl InMemoryTimelines {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heads: Mutex::new(HashMap::new()),
            current: Mutex::new("main".to_string()),
        })
    }

    pub async fn head_of(&self, timeline: &str) -> Option<Hash> {
        self.heads.lock().await.get(timeline).copied()
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
        timeline: &str,
    ) -> Result<Option<TimelineMetadata>, StorageError> {
        let heads = self.heads.lock().await;
        Ok(heads.get(timeline).map(|head| TimelineMetadata {
            name: timeline.to_string(),
            description: String::new(),
            head: *head,
            last_update: Utc::now(),
            author: Identity::new("test", "test@example.com"),
        }))
    }
}

/// A single-blob tree plus the seal pointing at it, stored into `storage`
/// and registered as `timeline`'s head in `timelines`.
pub async fn seed_seal(
    storage: &InMemoryStorage,
    timelines: &InMemoryTimelines,
    timeline: &str,
    message: &str,
    parents: Vec<Hash>,
) -> Hash {
    let blob = Blob::new(message.as_bytes().to_vec());
    let blob_hash = blob.content_hash();
    storage.store_blob(blob_hash, blob).await.unwrap();

    let tree = Tree::new(vec![ivaldi_sync::model::TreeEntry {
        name: "file.txt".to_string(),
        kind: ivaldi_sync::model::EntryKind::Blob,
        mode: 0o644,
        hash: blob_hash,
    }]);
    let tree_hash = tree.content_hash();
    storage.store_tree(tree_hash, tree).await.unwrap();

    let seal = Seal::new(
        timeline.to_string(),
        parents.len() as u64 + 1,
        message.to_string(),
        Identity::new("test", "test@example.com"),
        Utc::now(),
        parents,
        tree_hash,
    );
    let seal_hash = seal.hash();
    storage.store_seal(seal).await.unwrap();
    timelines.create(timeline, seal_hash).await.unwrap();
    seal_hash
}

/// Builds and starts a manager bound to an OS-assigned loopback port,
/// returning it alongside its storage/timelines handles for assertions.
pub async fn start_node(
    node_id: &str,
) -> (Arc<P2pManager>, Arc<InMemoryStorage>, Arc<InMemoryTimelines>) {
    let dir = Box::leak(Box::new(
        tempdir::TempDir::new("ivaldi-scenario").unwrap(),
    ));
    let mut config = P2PConfig::default();
    config.port = 0;
    config.discovery_port = 0;
    config.sync_interval_secs = 1;

    let storage = InMemoryStorage::new();
    let timelines = InMemoryTimelines::new();
    let manager = P2pManager::new(
        node_id.to_string(),
        config,
        dir.path(),
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&timelines) as Arc<dyn TimelineManager>,
    )
    .await;
    manager.start(vec![]).await.unwrap();
    (manager, storage, timelines)
}

/// The loopback address to dial to reach `manager`, derived from its
/// OS-assigned listener port.
pub async fn dial_addr(manager: &P2pManager) -> SocketAddr {
    let bound = manager.local_addr().await.expect("manager must be started");
    SocketAddr::new("127.0.0.1".parse().unwrap(), bound.port())
}
