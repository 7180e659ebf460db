//! Continuous synchronization engine: head gossip, object transfer,
//! divergence detection, and real-time update propagation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};

use crate::event_bus::{ConflictInfo, Event, EventBus};
use crate::hash::Hash;
use crate::model::Seal;
use crate::p2p::codec::{Message, Payload, SealBroadcastPayload, TimelineUpdatePayload};
use crate::p2p::{P2pError, P2pNetwork};
use crate::storage::{Storage, StorageError, TimelineManager};

use super::messages::{SyncRequest, SyncRequestType, SyncResponse};

const LOCAL_CHANGE_WATCH_SECS: u64 = 5;
const RECENT_SEALS_FOR_NEW_TIMELINE: usize = 10;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("network error: {0}")]
    Network(#[from] P2pError),
}

/// Per-peer bookkeeping kept by the sync engine, distinct from the P2P
/// layer's byte/message counters.
#[derive(Clone, Debug)]
pub struct PeerSyncState {
    pub peer_id: String,
    pub last_sync: DateTime<Utc>,
    pub timeline_heads: HashMap<String, Hash>,
    pub synced_seals: HashMap<String, DateTime<Utc>>,
    pub conflict_count: u64,
    pub bytes_transferred: u64,
    pub auto_sync_enabled: bool,
}

impl PeerSyncState {
    fn new(peer_id: String) -> Self {
        Self {
            peer_id,
            last_sync: Utc::now(),
            timeline_heads: HashMap::new(),
            synced_seals: HashMap::new(),
            conflict_count: 0,
            bytes_transferred: 0,
            auto_sync_enabled: true,
        }
    }
}

pub struct SyncEngine {
    storage: Arc<dyn Storage>,
    timelines: Arc<dyn TimelineManager>,
    network: Arc<P2pNetwork>,
    event_bus: Arc<EventBus>,
    peer_states: RwLock<HashMap<String, PeerSyncState>>,
    last_known_heads: RwLock<HashMap<String, Hash>>,
    auto_sync_enabled: bool,
    sync_interval_secs: u64,
    concurrency: Arc<Semaphore>,
    exit_channel: broadcast::Sender<()>,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        timelines: Arc<dyn TimelineManager>,
        network: Arc<P2pNetwork>,
        event_bus: Arc<EventBus>,
        auto_sync_enabled: bool,
        sync_interval_secs: u64,
        max_concurrent_sync: usize,
    ) -> Arc<Self> {
        let (exit_channel, _) = broadcast::channel(1);
        Arc::new(Self {
            storage,
            timelines,
            network,
            event_bus,
            peer_states: RwLock::new(HashMap::new()),
            last_known_heads: RwLock::new(HashMap::new()),
            auto_sync_enabled,
            sync_interval_secs,
            concurrency: Arc::new(Semaphore::new(max_concurrent_sync.max(1))),
            exit_channel,
        })
    }

    pub async fn peer_state(&self, peer_id: &str) -> Option<PeerSyncState> {
        self.peer_states.read().await.get(peer_id).cloned()
    }

    /// Spawns the auto-sync ticker and the local-change watcher. Message
    /// dispatch is wired separately by whatever owns both this engine and
    /// the mesh overlay (see [`crate::manager::P2pManager`]), since the
    /// network has a single handler slot shared by both consumers.
    pub async fn start(self: &Arc<Self>) {
        let ticker_engine = Arc::clone(self);
        tokio::spawn(async move { ticker_engine.auto_sync_loop().await });

        let watcher_engine = Arc::clone(self);
        tokio::spawn(async move { watcher_engine.local_change_watch_loop().await });
    }

    pub fn stop(&self) {
        let _ = self.exit_channel.send(());
    }

    async fn auto_sync_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.sync_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    if !self.auto_sync_enabled {
                        continue;
                    }
                    let peers = self.network.peer_ids().await;
                    let mut handles = Vec::new();
                    for peer_id in peers {
                        let engine = Arc::clone(&self);
                        let permit = Arc::clone(&engine.concurrency);
                        handles.push(tokio::spawn(async move {
                            let _permit = permit.acquire().await;
                            engine.sync_with_peer(&peer_id).await;
                        }));
                    }
                    for handle in handles {
                        let _ = handle.await;
                    }
                }
            }
        }
    }

    async fn local_change_watch_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(LOCAL_CHANGE_WATCH_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.check_local_changes().await;
                }
            }
        }
    }

    async fn check_local_changes(&self) {
        let timeline_names = match self.timelines.list_timelines().await {
            Ok(names) => names,
            Err(e) => {
                log::warn!("failed to list timelines for change watch: {}", e);
                return;
            }
        };
        for timeline in timeline_names {
            let head = match self.timelines.get_head(&timeline).await {
                Ok(Some(h)) => h,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("failed to read head for {}: {}", timeline, e);
                    continue;
                }
            };
            let changed = {
                let mut last_known = self.last_known_heads.write().await;
                let previous = last_known.insert(timeline.clone(), head);
                previous != Some(head)
            };
            // A timeline observed for the first time this tick is not a
            // "change" worth broadcasting; suppress it like a zero new_head.
            if !changed || head.is_zero() {
                continue;
            }
            let seal = match self.storage.load_seal(&head).await {
                Ok(seal) => seal,
                Err(e) => {
                    log::warn!("failed to load seal {} for broadcast: {}", head, e);
                    continue;
                }
            };
            let timeline = timeline.clone();
            let head_for_broadcast = head;
            self.network
                .broadcast(|| {
                    Payload::TimelineUpdate(TimelineUpdatePayload {
                        timeline: timeline.clone(),
                        new_head: head_for_broadcast,
                        seal: seal.clone(),
                    })
                })
                .await;
        }
    }

    pub async fn sync_with_peer(&self, peer_id: &str) {
        let timelines = match self.timelines.list_timelines().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("failed to list timelines for sync: {}", e);
                return;
            }
        };
        let mut local_heads = HashMap::new();
        for timeline in &timelines {
            if let Ok(Some(head)) = self.timelines.get_head(timeline).await {
                local_heads.insert(timeline.clone(), head);
            }
        }
        let request = SyncRequest {
            timelines,
            local_heads,
            request_type: SyncRequestType::Incremental,
            timestamp: Utc::now(),
        };
        if let Err(e) = self
            .network
            .send_to(peer_id, Payload::SyncRequest(request))
            .await
        {
            log::debug!("sync request to {} failed: {}", peer_id, e);
        }
    }

    pub async fn handle_message(&self, peer_id: String, message: Message) {
        match message.payload {
            Payload::SyncRequest(request) => {
                let response = self.handle_sync_request(&peer_id, request).await;
                if let Err(e) = self
                    .network
                    .send_to(&peer_id, Payload::SyncResponse(response))
                    .await
                {
                    log::debug!("sync response to {} failed: {}", peer_id, e);
                }
            }
            Payload::SyncResponse(response) => {
                self.handle_sync_response(&peer_id, response).await;
            }
            Payload::TimelineUpdate(update) => {
                self.handle_real_time_update(&peer_id, update).await;
            }
            Payload::SealBroadcast(SealBroadcastPayload { seal, .. }) => {
                if let Err(e) = self.storage.store_seal(seal).await {
                    log::warn!("failed to store broadcast seal from {}: {}", peer_id, e);
                }
            }
            _ => {}
        }
    }

    async fn handle_sync_request(&self, peer_id: &str, request: SyncRequest) -> SyncResponse {
        let mut response = SyncResponse::empty(Utc::now());
        for timeline in &request.timelines {
            let local_head = match self.timelines.get_head(timeline).await {
                Ok(head) => head,
                Err(e) => {
                    log::debug!("storage error reading head for {}: {}", timeline, e);
                    continue;
                }
            };
            let local_head = match local_head {
                Some(h) => h,
                None => continue,
            };
            response.timelines.push(timeline.clone());
            response.remote_heads.insert(timeline.clone(), local_head);

            let requester_head = request.local_heads.get(timeline).copied();
            match requester_head {
                None => {
                    if let Ok(recent) = self
                        .storage
                        .list_seals(timeline, RECENT_SEALS_FOR_NEW_TIMELINE)
                        .await
                    {
                        for seal in recent {
                            self.pack_seal_objects(&mut response, seal).await;
                        }
                    }
                }
                Some(requester_head) if requester_head == local_head => {}
                Some(requester_head) => {
                    let can_fast_forward = match self.storage.load_seal(&local_head).await {
                        Ok(Some(seal)) => seal.parents.contains(&requester_head),
                        _ => false,
                    };
                    if can_fast_forward {
                        response.missing_seals.push(local_head);
                        if let Ok(Some(seal)) = self.storage.load_seal(&local_head).await {
                            self.pack_seal_objects(&mut response, seal).await;
                        }
                    } else {
                        response.conflicts.push(ConflictInfo {
                            timeline: timeline.clone(),
                            local_head,
                            remote_head: requester_head,
                            conflict_type: "diverged".to_string(),
                        });
                    }
                }
            }
        }
        log::debug!("built sync response for {}", peer_id);
        response
    }

    /// Packs a seal plus every tree/blob transitively reachable from its
    /// `position`, per the response-packing contract. Storage errors for
    /// any single object are skipped; the response is best-effort.
    async fn pack_seal_objects(&self, response: &mut SyncResponse, seal: Seal) {
        let mut stack = vec![seal.position];
        let mut visited_trees = std::collections::HashSet::new();
        while let Some(tree_hash) = stack.pop() {
            if tree_hash.is_zero() || !visited_trees.insert(tree_hash) {
                continue;
            }
            let tree = match self.storage.load_tree(&tree_hash).await {
                Ok(Some(t)) => t,
                _ => continue,
            };
            for (entry, hash) in tree.child_hashes() {
                match entry.kind {
                    crate::model::EntryKind::Tree => stack.push(hash),
                    crate::model::EntryKind::Blob => {
                        if let Ok(Some(blob)) = self.storage.load_blob(&hash).await {
                            response.blobs_data.insert(hash, blob);
                        }
                    }
                }
            }
            response.trees_data.insert(tree_hash, tree);
        }
        if response.seals_data.iter().all(|s| s.hash() != seal.hash()) {
            response.seals_data.push(seal);
        }
    }

    async fn handle_sync_response(&self, peer_id: &str, response: SyncResponse) {
        let response_size = estimate_size(&response);
        for seal in &response.seals_data {
            if let Err(e) = self.storage.store_seal(seal.clone()).await {
                log::debug!("failed to store seal from {}: {}", peer_id, e);
            }
        }
        for (hash, tree) in response.trees_data.iter() {
            if let Err(e) = self.storage.store_tree(*hash, tree.clone()).await {
                log::debug!("failed to store tree from {}: {}", peer_id, e);
            }
        }
        for (hash, blob) in response.blobs_data.iter() {
            if let Err(e) = self.storage.store_blob(*hash, blob.clone()).await {
                log::debug!("failed to store blob from {}: {}", peer_id, e);
            }
        }

        for (timeline, remote_head) in &response.remote_heads {
            self.maybe_advance_head(timeline, *remote_head).await;
        }

        let mut conflict_delta = 0u64;
        for conflict in response.conflicts {
            conflict_delta += 1;
            self.event_bus.publish(Event::ConflictDetected(conflict));
        }

        let mut states = self.peer_states.write().await;
        let state = states
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerSyncState::new(peer_id.to_string()));
        state.last_sync = Utc::now();
        state.conflict_count += conflict_delta;
        state.bytes_transferred += response_size as u64;
        for (timeline, head) in response.remote_heads {
            state.timeline_heads.insert(timeline, head);
        }
    }

    async fn handle_real_time_update(&self, peer_id: &str, update: TimelineUpdatePayload) {
        if update.new_head.is_zero() {
            return;
        }
        if let Some(seal) = update.seal {
            if let Err(e) = self.storage.store_seal(seal).await {
                log::debug!("failed to store real-time seal from {}: {}", peer_id, e);
            }
        }
        let advanced = self.maybe_advance_head(&update.timeline, update.new_head).await;
        if !advanced {
            self.sync_with_peer(peer_id).await;
        }
    }

    /// Applies the `shouldUpdateToRemoteHead` predicate: advance only if
    /// the remote head differs from local AND the object now exists.
    async fn maybe_advance_head(&self, timeline: &str, remote_head: Hash) -> bool {
        let local_head = match self.timelines.get_head(timeline).await {
            Ok(head) => head,
            Err(_) => return false,
        };
        if let Some(local_head) = local_head {
            if remote_head == local_head {
                return false;
            }
        }
        match self.storage.has_object(&remote_head).await {
            Ok(true) => {}
            _ => return false,
        }

        let applied = match local_head {
            None => self.timelines.create(timeline, remote_head).await,
            Some(_) => self.timelines.update_head(timeline, remote_head).await,
        };
        if applied.is_ok() {
            self.event_bus.publish(Event::TimelineUpdated {
                timeline: timeline.to_string(),
                head: remote_head,
            });
            true
        } else {
            false
        }
    }
}

fn estimate_size(response: &SyncResponse) -> usize {
    serde_json::to_vec(response).map(|b| b.len()).unwrap_or(0)
}
