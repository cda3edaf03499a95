//! The clustering and routing protocol
//!
//! This module contains the wire messages, the event scheduler, the HEED
//! election, the tree bookkeeping and the coordinator state machine that
//! ties them together.

pub mod cluster;
pub mod coordinator;
pub mod event;
pub mod message;
pub mod routing;
pub mod scheduler;

pub use self::coordinator::ProtocolCoordinator;
pub use self::event::{EventKind, Origin, ProtocolEvent};
pub use self::message::{ControlMessage, SyncMessage};
pub use self::routing::RoutingTree;
pub use self::scheduler::ActionScheduler;
