//! Crate-wide error glue.
//!
//! Each subsystem owns its own `thiserror` enum (`config::ConfigError`,
//! `sentinel::SentinelError`, `p2p::P2pError`, `sync::SyncError`,
//! `mesh::MeshError`, `discovery::DiscoveryError`). `CoreError` exists only
//! for the façade, which has to report startup failures that can originate
//! in any of them.

use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::mesh::MeshError;
use crate::p2p::P2pError;
use crate::sentinel::SentinelError;
use crate::sync::SyncError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sentinel error: {0}")]
    Sentinel(#[from] SentinelError),

    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("a previous instance is still running (pid {0})")]
    AlreadyRunning(u32),
}
