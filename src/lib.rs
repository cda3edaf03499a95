//! sinktree: cluster-tree networking for wireless sensor meshes
//!
//! This library is the networking middle layer of a sensor mesh: nodes form
//! ad hoc clusters through a HEED-style head election, build a minimum-height
//! spanning tree rooted at a single sink, forward application data along that
//! tree with dedup and fragmentation, track neighbor liveness, and keep
//! clocks loosely synchronized with a round-trip exchange down the tree.
//! Everything hangs off a per-node [`Node`] context, so a single process can
//! simulate a whole mesh over an in-process [`network::RadioHub`].

pub mod core;
pub mod network;
pub mod node;
pub mod protocol;
pub mod sync;

// Re-export commonly used items
pub use crate::core::{Error, NodeAddress, ProtocolState, Result};
pub use crate::node::{Node, NodeConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
