//! Continuous synchronization: head gossip, object transfer, conflict
//! surfacing, real-time update propagation.

pub mod engine;
pub mod messages;

pub use engine::{PeerSyncState, SyncEngine, SyncError};
pub use messages::{SyncRequest, SyncRequestType, SyncResponse};
