//! Direct-peer TCP transport: framed codec, per-peer registry, network.

pub mod codec;
pub mod network;
pub mod peer;

pub use codec::{Message, Payload};
pub use network::{MessageHandler, P2pError, P2pNetwork};
pub use peer::{Peer, PeerMetrics, PeerMetricsSnapshot};
