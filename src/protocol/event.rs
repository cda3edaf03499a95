use crate::core::NodeAddress;
use crate::protocol::message::{ControlMessage, SyncMessage};

/// Over-the-air provenance of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Sender address reported by the radio
    pub node: NodeAddress,
    /// Received signal strength
    pub rssi: i16,
}

/// The payload of a protocol event
///
/// Received control frames and local timers share one exhaustive enum; the
/// coordinator adds cases here instead of growing a byte-code space. Timer
/// variants carry the round/route generation that scheduled them, so a
/// handler can no-op when the generation is stale (cancellation is logical;
/// nothing is removed from the queue).
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A routing/clustering control frame received over the air
    Control(ControlMessage),

    /// A time-sync frame received over the air; the event timestamp is the
    /// link-layer arrival stamp
    Sync(SyncMessage),

    /// Next HEED election step is due
    ClusterStep { round: u64 },

    /// Election settle delay elapsed; run step 3
    ClusterFinalize { round: u64 },

    /// Bounded wait for routing offers expired
    OfferDeadline { route: u64 },

    /// Longer final deadline for a head that found no parent
    HeadFinalDeadline { route: u64 },

    /// Bounded wait for add-route parent offers expired
    AddDeadline { route: u64, backoff_ms: u64 },

    /// Periodic status heartbeat is due
    HeartbeatTick,

    /// Forced re-route trigger (upper-layer call or received flood)
    ForcedReroute,

    /// Begin single-node recovery
    AddReroute,

    /// Sink re-route epoch elapsed
    RerouteEpochTick,

    /// Sink time-sync epoch elapsed
    SyncEpochTick,

    /// One-shot on-demand time sync (after a completed re-route)
    SyncNow,

    /// A pending time-sync exchange got no reply in time
    SyncRetry { generation: u64 },

    /// A neighbor was evicted by the liveness monitor
    NodeDead { node: NodeAddress },
}

/// A single protocol event
///
/// Total order by execution timestamp; ties are unordered. An event becomes
/// visible to the coordinator only at or after its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    /// Execution timestamp in clock milliseconds
    pub at: u64,
    /// Set when the event was received over the air
    pub origin: Option<Origin>,
    /// The event payload
    pub kind: EventKind,
}

impl ProtocolEvent {
    /// A local (timer) event due at `at`
    pub fn local(at: u64, kind: EventKind) -> Self {
        ProtocolEvent {
            at,
            origin: None,
            kind,
        }
    }

    /// An event received over the air from `node`
    pub fn received(at: u64, node: NodeAddress, rssi: i16, kind: EventKind) -> Self {
        ProtocolEvent {
            at,
            origin: Some(Origin { node, rssi }),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let e = ProtocolEvent::local(42, EventKind::HeartbeatTick);
        assert_eq!(e.at, 42);
        assert!(e.origin.is_none());

        let node = NodeAddress(9);
        let e = ProtocolEvent::received(7, node, -55, EventKind::ForcedReroute);
        assert_eq!(e.origin, Some(Origin { node, rssi: -55 }));
    }
}
