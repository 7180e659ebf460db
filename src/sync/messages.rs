//! Wire payloads exchanged by the sync engine.
//!
//! Kept separate from [`crate::p2p::codec`] so the sync domain types can be
//! unit-tested without pulling in the framed-codec machinery.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_bus::ConflictInfo;
use crate::hash::Hash;
use crate::model::{Blob, Seal, Tree};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRequestType {
    Full,
    Incremental,
    Check,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub timelines: Vec<String>,
    pub local_heads: HashMap<String, Hash>,
    pub request_type: SyncRequestType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SyncResponse {
    pub timelines: Vec<String>,
    pub remote_heads: HashMap<String, Hash>,
    pub missing_seals: Vec<Hash>,
    pub seals_data: Vec<Seal>,
    pub trees_data: HashMap<Hash, Tree>,
    pub blobs_data: HashMap<Hash, Blob>,
    pub conflicts: Vec<ConflictInfo>,
    pub timestamp: DateTime<Utc>,
}

impl SyncResponse {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }
}
