//! Radio access, packet transport and neighbor liveness
//!
//! Everything below the protocol state machine: the radio abstraction (with
//! an in-process hub for simulated meshes), the framing/forwarding layer and
//! the neighbor liveness monitor.

pub mod monitor;
pub mod radio;
pub mod transport;

pub use self::monitor::{DeadNodeSink, NodeLivenessMonitor};
pub use self::radio::{Radio, RadioHub, RxFrame};
pub use self::transport::{ForwardMode, PacketTransport};
