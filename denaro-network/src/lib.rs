//! The peer layer: node registry with liveness tracking, bounded HTTP
//! client, gossip fan-out, and reorg-aware chain synchronization.

pub mod client;
pub mod gossip;
pub mod registry;
pub mod sync;

pub use client::{NodeInterface, PeerError, RemoteBlock, RemoteBlockResponse};
pub use registry::NodeRegistry;
pub use sync::{ChainSync, SyncError};
