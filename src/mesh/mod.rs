//! Mesh overlay: multi-hop routing layered atop the direct-peer P2P network.

pub mod message;
pub mod overlay;
pub mod routing;
pub mod topology;

pub use message::{MeshMessage, MeshMessageType};
pub use overlay::{MeshError, MeshOverlay};
pub use routing::compute_routes;
pub use topology::{MeshPeer, TopologySnapshot};
