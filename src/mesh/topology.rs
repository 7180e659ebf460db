//! Topology table: this node's view of the mesh graph.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::hash::{hash, Hashable};

/// Default time-to-live for entries that are not direct peers.
pub const DEFAULT_TOPOLOGY_TTL_SECS: i64 = 5 * 60;
/// TTL carried on a freshly originated topology gossip broadcast.
pub const GOSSIP_INITIAL_TTL: u8 = 3;

/// One entry in the topology table: either the self-entry, a direct peer,
/// or a peer known only transitively through gossip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshPeer {
    pub node_id: String,
    pub address: String,
    pub direct_connect: bool,
    pub hops: u32,
    pub next_hop: String,
    pub last_seen: DateTime<Utc>,
    /// Node IDs this peer reported as *its* neighbors, used as edges when
    /// computing shortest paths.
    pub peers: Vec<String>,
}

impl MeshPeer {
    pub fn self_entry(node_id: String, address: String) -> Self {
        Self {
            next_hop: node_id.clone(),
            node_id,
            address,
            direct_connect: false,
            hops: 0,
            last_seen: Utc::now(),
            peers: Vec::new(),
        }
    }

    pub fn direct(node_id: String, address: String) -> Self {
        Self {
            next_hop: node_id.clone(),
            node_id,
            address,
            direct_connect: true,
            hops: 1,
            last_seen: Utc::now(),
            peers: Vec::new(),
        }
    }
}

/// Wire shape of a single entry inside a gossip snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyEntryWire {
    pub node_id: String,
    pub address: String,
    pub hops: u32,
    pub last_seen: DateTime<Utc>,
    pub peers: Vec<String>,
}

impl From<&MeshPeer> for TopologyEntryWire {
    fn from(peer: &MeshPeer) -> Self {
        Self {
            node_id: peer.node_id.clone(),
            address: peer.address.clone(),
            hops: peer.hops,
            last_seen: peer.last_seen,
            peers: peer.peers.clone(),
        }
    }
}

/// The `mesh_topology` wire payload: a gossip of the sender's topology view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub from: String,
    pub ttl: u8,
    pub entries: Vec<TopologyEntryWire>,
}

impl Hashable for TopologySnapshot {
    fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("topology snapshot is always serializable")
    }
}

/// Fingerprint used to decide whether we've already forwarded this exact
/// gossip payload, independent of TTL (which strictly decreases per hop).
pub fn snapshot_fingerprint(snapshot: &TopologySnapshot) -> crate::hash::Hash {
    hash(&snapshot.canonical_bytes())
}

/// Topology table guarded by a single `RwLock`, per the shared-resource
/// policy: snapshots are taken under the lock and released before I/O.
pub struct TopologyTable {
    entries: RwLock<HashMap<String, MeshPeer>>,
}

impl TopologyTable {
    pub fn new(self_id: String, self_address: String) -> Self {
        let mut entries = HashMap::new();
        entries.insert(self_id.clone(), MeshPeer::self_entry(self_id, self_address));
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub async fn snapshot(&self) -> Vec<MeshPeer> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<MeshPeer> {
        self.entries.read().await.get(node_id).cloned()
    }

    pub async fn insert_direct(&self, node_id: String, address: String) {
        let mut entries = self.entries.write().await;
        entries.insert(node_id.clone(), MeshPeer::direct(node_id, address));
    }

    pub async fn remove(&self, node_id: &str) {
        self.entries.write().await.remove(node_id);
    }

    /// Apply a remote topology entry per the gossip-adoption rule: insert if
    /// absent, or adopt if it represents a strictly shorter route than what
    /// we currently hold. Returns whether the table actually changed.
    pub async fn apply_remote_entry(
        &self,
        self_id: &str,
        from: &str,
        remote: &TopologyEntryWire,
    ) -> bool {
        if remote.node_id == self_id {
            return false;
        }
        let mut entries = self.entries.write().await;
        match entries.get(&remote.node_id) {
            None => {
                entries.insert(
                    remote.node_id.clone(),
                    MeshPeer {
                        node_id: remote.node_id.clone(),
                        address: remote.address.clone(),
                        direct_connect: false,
                        hops: remote.hops + 1,
                        next_hop: from.to_string(),
                        last_seen: remote.last_seen,
                        peers: remote.peers.clone(),
                    },
                );
                true
            }
            Some(existing) => {
                if existing.direct_connect {
                    if existing.peers != remote.peers {
                        let mut updated = existing.clone();
                        updated.peers = remote.peers.clone();
                        entries.insert(remote.node_id.clone(), updated);
                        return true;
                    }
                    return false;
                }
                let candidate_hops = remote.hops + 1;
                if remote.last_seen >= existing.last_seen && candidate_hops < existing.hops {
                    entries.insert(
                        remote.node_id.clone(),
                        MeshPeer {
                            node_id: remote.node_id.clone(),
                            address: remote.address.clone(),
                            direct_connect: false,
                            hops: candidate_hops,
                            next_hop: from.to_string(),
                            last_seen: remote.last_seen,
                            peers: remote.peers.clone(),
                        },
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Evict non-direct entries whose `last_seen` has aged past `ttl`.
    pub async fn cleanup_expired(&self, ttl_secs: i64) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs);
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|p| !p.direct_connect && p.hops > 0 && p.last_seen < cutoff)
            .map(|p| p.node_id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }
}
