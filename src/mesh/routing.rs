//! Dijkstra shortest-path routing over the topology graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::topology::MeshPeer;

/// Computes `routes[target]` for every node reachable from `self_id`: the
/// ordered list of node IDs from the first hop to `target` inclusive.
/// Direct peers always resolve to the single-element path `[target]`,
/// regardless of what the graph search would otherwise produce.
pub fn compute_routes(
    self_id: &str,
    direct_peers: &HashSet<String>,
    topology: &[MeshPeer],
) -> HashMap<String, Vec<String>> {
    let adjacency = build_adjacency(self_id, direct_peers, topology);

    let mut dist: HashMap<String, u32> = HashMap::new();
    let mut prev: HashMap<String, String> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(self_id.to_string(), 0);
    heap.push(Reverse((0u32, self_id.to_string())));

    while let Some(Reverse((cost, node))) = heap.pop() {
        if dist.get(&node).map(|&d| d < cost).unwrap_or(false) {
            continue;
        }
        let Some(neighbors) = adjacency.get(&node) else {
            continue;
        };
        for neighbor in neighbors {
            let candidate = cost + 1;
            let better = dist.get(neighbor).map(|&d| candidate < d).unwrap_or(true);
            if better {
                dist.insert(neighbor.clone(), candidate);
                prev.insert(neighbor.clone(), node.clone());
                heap.push(Reverse((candidate, neighbor.clone())));
            }
        }
    }

    let mut routes = HashMap::new();
    for node in dist.keys() {
        if node == self_id {
            continue;
        }
        if direct_peers.contains(node) {
            routes.insert(node.clone(), vec![node.clone()]);
            continue;
        }
        let mut path = Vec::new();
        let mut cursor = node.clone();
        while cursor != self_id {
            path.push(cursor.clone());
            match prev.get(&cursor) {
                Some(p) => cursor = p.clone(),
                None => break,
            }
        }
        path.reverse();
        if !path.is_empty() {
            routes.insert(node.clone(), path);
        }
    }
    routes
}

/// The self node's edges come from the live direct-peer set, not the
/// topology table's self-entry (which may lag); every other node's edges
/// come from the peers it last reported, applied symmetrically so a
/// connection reported by only one side still routes both ways.
fn build_adjacency(
    self_id: &str,
    direct_peers: &HashSet<String>,
    topology: &[MeshPeer],
) -> HashMap<String, Vec<String>> {
    let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
    adjacency
        .entry(self_id.to_string())
        .or_default()
        .extend(direct_peers.iter().cloned());
    for peer in direct_peers {
        adjacency
            .entry(peer.clone())
            .or_default()
            .insert(self_id.to_string());
    }

    for entry in topology {
        if entry.node_id == self_id {
            continue;
        }
        for neighbor in &entry.peers {
            adjacency
                .entry(entry.node_id.clone())
                .or_default()
                .insert(neighbor.clone());
            adjacency
                .entry(neighbor.clone())
                .or_default()
                .insert(entry.node_id.clone());
        }
    }

    adjacency
        .into_iter()
        .map(|(k, v)| (k, v.into_iter().collect()))
        .collect()
}
