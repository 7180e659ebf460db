//! Mesh overlay: topology gossip, route maintenance, healing, cleanup, and
//! multi-hop message routing, layered atop the direct-peer P2P network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::event_bus::{Event, EventBus, EventKind};
use crate::p2p::codec::Message;
use crate::p2p::{P2pNetwork, Payload};

use super::message::{MeshMessage, MeshMessageType};
use super::routing::compute_routes;
use super::topology::{
    snapshot_fingerprint, MeshPeer, TopologyEntryWire, TopologySnapshot, TopologyTable,
    DEFAULT_TOPOLOGY_TTL_SECS, GOSSIP_INITIAL_TTL,
};

const TOPOLOGY_GOSSIP_INTERVAL_SECS: u64 = 30;
const ROUTE_MAINTENANCE_INTERVAL_SECS: u64 = 30;
const HEALING_INTERVAL_SECS: u64 = 60;
const CLEANUP_INTERVAL_SECS: u64 = 120;
const HEALING_MAX_HOPS: u32 = 2;
const SEEN_FINGERPRINT_CAPACITY: usize = 4096;

/// Retry policy for a full topology snapshot (`mesh_topology`) send: up to
/// 3 retries with exponential backoff starting at 1s, bounded overall.
const TOPOLOGY_UPDATE_MAX_RETRIES: u32 = 3;
const TOPOLOGY_UPDATE_BASE_DELAY: Duration = Duration::from_secs(1);
const TOPOLOGY_UPDATE_OVERALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for a routed `mesh_topology_request` forward: up to 2
/// retries at a constant 500ms, bounded overall.
const TOPOLOGY_REQUEST_MAX_RETRIES: u32 = 2;
const TOPOLOGY_REQUEST_BASE_DELAY: Duration = Duration::from_millis(500);
const TOPOLOGY_REQUEST_OVERALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends one payload to `peer_id`, retrying on failure up to `max_retries`
/// times with delay doubling from `base_delay`, never past `overall_timeout`
/// from the first attempt.
async fn send_with_retry(
    network: &P2pNetwork,
    peer_id: &str,
    mut build_payload: impl FnMut() -> Payload,
    max_retries: u32,
    base_delay: Duration,
    overall_timeout: Duration,
) -> Result<(), crate::p2p::P2pError> {
    let deadline = tokio::time::Instant::now() + overall_timeout;
    let mut delay = base_delay;
    let mut last_err = None;
    for attempt in 0..=max_retries {
        match network.send_to(peer_id, build_payload()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                let now = tokio::time::Instant::now();
                if attempt == max_retries || now >= deadline {
                    break;
                }
                tokio::time::sleep(delay.min(deadline - now)).await;
                delay *= 2;
            }
        }
    }
    Err(last_err.expect("loop always attempts at least once"))
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("no route to {0}")]
    NoRoute(String),
    #[error("max hop count exceeded for message {0}")]
    MaxHopsExceeded(String),
    #[error("network error: {0}")]
    Network(#[from] crate::p2p::P2pError),
}

pub struct MeshOverlay {
    self_id: String,
    self_address: String,
    network: Arc<P2pNetwork>,
    event_bus: Arc<EventBus>,
    topology: TopologyTable,
    routes: RwLock<HashMap<String, Vec<String>>>,
    seen_fingerprints: RwLock<Vec<crate::hash::Hash>>,
    exit_channel: broadcast::Sender<()>,
}

impl MeshOverlay {
    pub fn new(
        self_id: String,
        self_address: String,
        network: Arc<P2pNetwork>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (exit_channel, _) = broadcast::channel(1);
        Arc::new(Self {
            topology: TopologyTable::new(self_id.clone(), self_address.clone()),
            self_id,
            self_address,
            network,
            event_bus,
            routes: RwLock::new(HashMap::new()),
            seen_fingerprints: RwLock::new(Vec::new()),
            exit_channel,
        })
    }

    pub async fn topology_snapshot(&self) -> Vec<MeshPeer> {
        self.topology.snapshot().await
    }

    pub async fn routes_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.routes.read().await.clone()
    }

    /// Subscribes to peer lifecycle events and spawns the four periodic
    /// services.
    pub async fn start(self: &Arc<Self>) {
        let insert_overlay = Arc::clone(self);
        self.event_bus
            .subscribe(EventKind::PeerConnected, move |event| {
                let overlay = Arc::clone(&insert_overlay);
                async move {
                    if let Event::PeerConnected { peer_id, address } = event {
                        overlay.topology.insert_direct(peer_id, address.to_string()).await;
                    }
                }
            })
            .await;

        let remove_overlay = Arc::clone(self);
        self.event_bus
            .subscribe(EventKind::PeerDisconnected, move |event| {
                let overlay = Arc::clone(&remove_overlay);
                async move {
                    if let Event::PeerDisconnected { peer_id } = event {
                        overlay.topology.remove(&peer_id).await;
                    }
                }
            })
            .await;

        let gossip_overlay = Arc::clone(self);
        tokio::spawn(async move { gossip_overlay.gossip_loop().await });

        let route_overlay = Arc::clone(self);
        tokio::spawn(async move { route_overlay.route_maintenance_loop().await });

        let heal_overlay = Arc::clone(self);
        tokio::spawn(async move { heal_overlay.healing_loop().await });

        let cleanup_overlay = Arc::clone(self);
        tokio::spawn(async move { cleanup_overlay.cleanup_loop().await });
    }

    pub fn stop(&self) {
        let _ = self.exit_channel.send(());
    }

    /// Broadcasts topology and recomputes routes immediately, bypassing the
    /// periodic tickers. Used by callers that need the overlay to converge
    /// on a known schedule rather than waiting up to
    /// `TOPOLOGY_GOSSIP_INTERVAL_SECS`.
    pub async fn gossip_now(&self) {
        self.broadcast_topology(GOSSIP_INITIAL_TTL).await;
        self.recompute_routes().await;
    }

    /// Runs one healing pass immediately rather than waiting for the
    /// periodic ticker.
    pub async fn heal_now(&self) {
        self.heal().await;
    }

    async fn direct_peer_ids(&self) -> HashSet<String> {
        self.network.peer_ids().await.into_iter().collect()
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(TOPOLOGY_GOSSIP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.broadcast_topology(GOSSIP_INITIAL_TTL).await;
                }
            }
        }
    }

    async fn broadcast_topology(&self, ttl: u8) {
        let direct: Vec<String> = self.direct_peer_ids().await.into_iter().collect();
        let entries: Vec<TopologyEntryWire> = self
            .topology
            .snapshot()
            .await
            .iter()
            .map(|peer| {
                let mut wire = TopologyEntryWire::from(peer);
                if peer.node_id == self.self_id {
                    wire.peers = direct.clone();
                }
                wire
            })
            .collect();
        let snapshot = TopologySnapshot {
            from: self.self_id.clone(),
            ttl,
            entries,
        };
        for peer_id in direct {
            let network = Arc::clone(&self.network);
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                if let Err(e) = send_with_retry(
                    &network,
                    &peer_id,
                    || Payload::MeshTopology(snapshot.clone()),
                    TOPOLOGY_UPDATE_MAX_RETRIES,
                    TOPOLOGY_UPDATE_BASE_DELAY,
                    TOPOLOGY_UPDATE_OVERALL_TIMEOUT,
                )
                .await
                {
                    log::debug!("topology broadcast to {} failed after retries: {}", peer_id, e);
                }
            });
        }
    }

    async fn route_maintenance_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(ROUTE_MAINTENANCE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.recompute_routes().await;
                }
            }
        }
    }

    async fn recompute_routes(&self) {
        let direct = self.direct_peer_ids().await;
        let topology = self.topology.snapshot().await;
        let routes = compute_routes(&self.self_id, &direct, &topology);
        *self.routes.write().await = routes;
    }

    async fn healing_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(HEALING_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.heal().await;
                }
            }
        }
    }

    async fn heal(&self) {
        let candidates: Vec<MeshPeer> = self
            .topology
            .snapshot()
            .await
            .into_iter()
            .filter(|p| {
                !p.direct_connect
                    && p.hops > 0
                    && p.hops <= HEALING_MAX_HOPS
                    && !p.address.is_empty()
                    && p.address != "localhost"
            })
            .collect();
        for candidate in candidates {
            let address: std::net::SocketAddr = match candidate.address.parse() {
                Ok(a) => a,
                Err(_) => continue,
            };
            if let Err(e) = self.network.dial(address).await {
                log::debug!("healing dial to {} failed: {}", candidate.node_id, e);
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut exit = self.exit_channel.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = ticker.tick() => {
                    self.topology.cleanup_expired(DEFAULT_TOPOLOGY_TTL_SECS).await;
                    self.recompute_routes().await;
                }
            }
        }
    }

    /// Dispatches a received `mesh_topology` or `mesh_topology_request`
    /// message. Everything else is the sync engine's concern.
    pub async fn handle_message(&self, peer_id: String, message: Message) {
        match message.payload {
            Payload::MeshTopology(snapshot) => self.handle_topology_gossip(peer_id, snapshot).await,
            Payload::MeshTopologyRequest(routed) => self.route_message(routed).await,
            _ => {}
        }
    }

    async fn handle_topology_gossip(&self, from_peer: String, snapshot: TopologySnapshot) {
        if snapshot.ttl == 0 {
            return;
        }
        let fingerprint = snapshot_fingerprint(&snapshot);
        {
            let mut seen = self.seen_fingerprints.write().await;
            if seen.contains(&fingerprint) {
                return;
            }
            seen.push(fingerprint);
            if seen.len() > SEEN_FINGERPRINT_CAPACITY {
                seen.remove(0);
            }
        }

        let mut mutated = false;
        for entry in &snapshot.entries {
            if self
                .topology
                .apply_remote_entry(&self.self_id, &snapshot.from, entry)
                .await
            {
                mutated = true;
            }
        }

        if mutated && snapshot.ttl > 1 {
            let forwarded = TopologySnapshot {
                from: self.self_id.clone(),
                ttl: snapshot.ttl - 1,
                entries: snapshot.entries,
            };
            let direct_peers = self.network.peer_ids().await;
            for peer_id in direct_peers {
                if peer_id == from_peer {
                    continue;
                }
                let network = Arc::clone(&self.network);
                let forwarded = forwarded.clone();
                tokio::spawn(async move {
                    if let Err(e) = send_with_retry(
                        &network,
                        &peer_id,
                        || Payload::MeshTopology(forwarded.clone()),
                        TOPOLOGY_UPDATE_MAX_RETRIES,
                        TOPOLOGY_UPDATE_BASE_DELAY,
                        TOPOLOGY_UPDATE_OVERALL_TIMEOUT,
                    )
                    .await
                    {
                        log::debug!("topology re-forward to {} failed after retries: {}", peer_id, e);
                    }
                });
            }
        }
    }

    /// Routes a [`MeshMessage`] one hop closer to `final_target`, or
    /// dispatches it locally if we are the target.
    pub async fn route_message(&self, mut message: MeshMessage) {
        if message.current_hop >= message.max_hops {
            log::debug!("dropping mesh message {}: max hops exceeded", message.message_id);
            return;
        }

        if message.final_target == self.self_id {
            self.dispatch_local(message).await;
            return;
        }

        let next_hop = {
            let routes = self.routes.read().await;
            routes
                .get(&message.final_target)
                .and_then(|path| path.first())
                .cloned()
        };
        let Some(next_hop) = next_hop else {
            log::debug!("no route to {}, dropping mesh message", message.final_target);
            return;
        };

        message.current_hop += 1;
        message.route.push(self.self_id.clone());
        let network = Arc::clone(&self.network);
        tokio::spawn(async move {
            if let Err(e) = send_with_retry(
                &network,
                &next_hop,
                || Payload::MeshTopologyRequest(message.clone()),
                TOPOLOGY_REQUEST_MAX_RETRIES,
                TOPOLOGY_REQUEST_BASE_DELAY,
                TOPOLOGY_REQUEST_OVERALL_TIMEOUT,
            )
            .await
            {
                log::debug!("routed mesh message to {} failed after retries: {}", next_hop, e);
            }
        });
    }

    async fn dispatch_local(&self, message: MeshMessage) {
        match message.message_type {
            MeshMessageType::Ping => {
                let pong = MeshMessage::new(
                    message.message_id,
                    self.self_id.clone(),
                    message.original_sender,
                    MeshMessageType::Pong,
                    serde_json::Value::Null,
                );
                self.route_message(pong).await;
            }
            MeshMessageType::Pong => {}
            MeshMessageType::TopologyRequest => {
                self.broadcast_topology(1).await;
            }
            MeshMessageType::TopologyUpdate => {
                if let Ok(snapshot) = serde_json::from_value::<TopologySnapshot>(message.payload) {
                    self.handle_topology_gossip(message.original_sender, snapshot).await;
                }
            }
        }
    }

    /// Sends a `ping` to `target`, routed through the mesh if not a direct
    /// peer.
    pub async fn ping(&self, target: &str) {
        let message = MeshMessage::new(
            crate::p2p::codec::generate_message_id(),
            self.self_id.clone(),
            target.to_string(),
            MeshMessageType::Ping,
            serde_json::Value::Null,
        );
        self.route_message(message).await;
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }
}
