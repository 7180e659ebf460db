//! Multi-hop routed message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_HOPS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshMessageType {
    Ping,
    Pong,
    TopologyRequest,
    TopologyUpdate,
}

/// Carried as the payload of the wire-level `mesh_topology_request` message
/// type, which this crate repurposes as the generic multi-hop envelope
/// (see DESIGN.md for the rationale — the enumerated wire types have no
/// dedicated slot for an arbitrary routed message).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshMessage {
    pub message_id: String,
    pub original_sender: String,
    pub final_target: String,
    pub current_hop: u32,
    pub max_hops: u32,
    pub message_type: MeshMessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub route: Vec<String>,
}

impl MeshMessage {
    pub fn new(
        message_id: String,
        original_sender: String,
        final_target: String,
        message_type: MeshMessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id,
            original_sender,
            final_target,
            current_hop: 0,
            max_hops: DEFAULT_MAX_HOPS,
            message_type,
            payload,
            timestamp: Utc::now(),
            route: Vec::new(),
        }
    }
}
