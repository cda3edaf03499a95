use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Node identifier on the radio network
///
/// Opaque fixed-width value, compared by value, carried as 8 big-endian
/// bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(pub u64);

impl NodeAddress {
    /// Generates a new random node address
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        NodeAddress(rng.gen())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Protocol state of a node
///
/// A node boots as `NoRoute`; the sink boots directly into `RoutedHead`
/// and never leaves it. A dead-node notice is an event tag, never a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// No parent, no cluster, not participating in a route
    NoRoute,
    /// Routed cluster head: has a parent (or is the sink) and may parent others
    RoutedHead,
    /// Routed cluster member attached to a head
    RoutedMember,
    /// Running cluster-head election as part of a network-wide re-route
    ForcedClustering,
    /// Waiting for routing offers after a forced election
    ForcedWaitingForParent,
    /// Running cluster-head election as part of single-node recovery
    AddClustering,
    /// Waiting for parent offers during single-node recovery
    AddWaitingForParent,
}

impl ProtocolState {
    /// Returns true when the node holds a settled position in the tree
    pub fn is_routed(&self) -> bool {
        matches!(self, ProtocolState::RoutedHead | ProtocolState::RoutedMember)
    }

    /// Wire encoding of the state as a single byte
    pub fn to_byte(self) -> u8 {
        match self {
            ProtocolState::NoRoute => 0,
            ProtocolState::RoutedHead => 1,
            ProtocolState::RoutedMember => 2,
            ProtocolState::ForcedClustering => 3,
            ProtocolState::ForcedWaitingForParent => 4,
            ProtocolState::AddClustering => 5,
            ProtocolState::AddWaitingForParent => 6,
        }
    }

    /// Decodes a state byte from the wire
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ProtocolState::NoRoute),
            1 => Some(ProtocolState::RoutedHead),
            2 => Some(ProtocolState::RoutedMember),
            3 => Some(ProtocolState::ForcedClustering),
            4 => Some(ProtocolState::ForcedWaitingForParent),
            5 => Some(ProtocolState::AddClustering),
            6 => Some(ProtocolState::AddWaitingForParent),
            _ => None,
        }
    }
}

/// Per-neighbor liveness record
///
/// Presence in the neighbor table means "currently reachable from here".
#[derive(Debug, Clone)]
pub struct NeighborRecord {
    /// Timestamp (ms) of the most recent frame of any type from this neighbor
    pub last_seen: u64,
    /// Consecutive unacknowledged-send failures toward this neighbor
    pub failures: u32,
}

/// Cluster-head election bookkeeping
///
/// Tentative and final head sets are disjoint: promotion to final removes
/// the node from the tentative set.
#[derive(Debug, Default)]
pub struct ClusterState {
    tentative: HashSet<NodeAddress>,
    finals: HashSet<NodeAddress>,
    costs: HashMap<NodeAddress, u32>,
    /// Cluster members attached to us (only populated on heads)
    members: HashSet<NodeAddress>,
}

impl ClusterState {
    /// Records a head claim from `node` with the given cost
    ///
    /// A FINAL claim overrides an earlier TENTATIVE claim from the same
    /// sender; a TENTATIVE claim never demotes a FINAL one.
    pub fn record_claim(&mut self, node: NodeAddress, cost: u32, is_final: bool) {
        self.costs.insert(node, cost);
        if is_final {
            self.tentative.remove(&node);
            self.finals.insert(node);
        } else if !self.finals.contains(&node) {
            self.tentative.insert(node);
        }
    }

    /// Returns true if `node` has made a FINAL claim
    pub fn is_final(&self, node: &NodeAddress) -> bool {
        self.finals.contains(node)
    }

    /// Returns true if any head (tentative or final) is known
    pub fn any_head_known(&self) -> bool {
        !self.tentative.is_empty() || !self.finals.is_empty()
    }

    /// Minimum-cost candidate among all known heads, uniform-random tie-break
    ///
    /// Candidates with no cost entry are skipped, not treated as cost zero.
    pub fn pick_min_head(&self, rng: &mut impl Rng) -> Option<NodeAddress> {
        pick_min_by_cost(self.tentative.iter().chain(self.finals.iter()).copied(), &self.costs, rng)
    }

    /// Minimum-cost candidate among FINAL heads only
    pub fn pick_min_final(&self, rng: &mut impl Rng) -> Option<NodeAddress> {
        pick_min_by_cost(self.finals.iter().copied(), &self.costs, rng)
    }

    /// Adds a cluster member (we are its head)
    pub fn add_member(&mut self, node: NodeAddress) {
        self.members.insert(node);
    }

    /// Removes a cluster member
    pub fn remove_member(&mut self, node: &NodeAddress) {
        self.members.remove(node);
    }

    /// Current cluster members
    pub fn members(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.members.iter().copied()
    }

    /// Forgets everything known about `node`
    pub fn forget(&mut self, node: &NodeAddress) {
        self.tentative.remove(node);
        self.finals.remove(node);
        self.costs.remove(node);
        self.members.remove(node);
    }

    /// Clears all election state, including membership
    pub fn clear(&mut self) {
        self.tentative.clear();
        self.finals.clear();
        self.costs.clear();
        self.members.clear();
    }

    #[cfg(test)]
    pub fn tentative_count(&self) -> usize {
        self.tentative.len()
    }

    #[cfg(test)]
    pub fn final_count(&self) -> usize {
        self.finals.len()
    }
}

/// Minimum-cost pick with uniform-random tie-break
///
/// Candidates missing from the cost map are skipped. The uniformity of the
/// tie-break under adversarial cost distributions is assumed, not derived.
pub fn pick_min_by_cost(
    candidates: impl Iterator<Item = NodeAddress>,
    costs: &HashMap<NodeAddress, u32>,
    rng: &mut impl Rng,
) -> Option<NodeAddress> {
    let mut best_cost: Option<u32> = None;
    let mut best: Vec<NodeAddress> = Vec::new();

    for node in candidates {
        let Some(&cost) = costs.get(&node) else {
            continue;
        };
        match best_cost {
            Some(c) if cost > c => {}
            Some(c) if cost == c => best.push(node),
            _ => {
                best_cost = Some(cost);
                best.clear();
                best.push(node);
            }
        }
    }

    if best.is_empty() {
        None
    } else {
        Some(best[rng.gen_range(0..best.len())])
    }
}

/// Monotonic-enough millisecond clock
///
/// The protocol only ever compares and differences these values, so any
/// consistent millisecond source works; tests substitute a manual clock.
pub trait Clock: Send + Sync + 'static {
    /// Current raw time in milliseconds
    fn now_ms(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Runtime tunables, set through the upper-layer API
///
/// All fields are atomics read at each use, so setter changes take effect
/// on the next protocol action without restart.
#[derive(Debug)]
pub struct Tunables {
    /// Liveness sweep period in milliseconds
    monitor_sleep_ms: AtomicU64,
    /// Period between sink-driven forced re-routes in milliseconds
    reroute_epoch_ms: AtomicU64,
    /// Period between sink-driven time syncs in milliseconds
    sync_epoch_ms: AtomicU64,
    /// Transmit power used for intra-cluster traffic
    power_intra: AtomicU8,
    /// Transmit power used for inter-cluster traffic
    power_inter: AtomicU8,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            monitor_sleep_ms: AtomicU64::new(super::DEFAULT_MONITOR_SLEEP_MS),
            reroute_epoch_ms: AtomicU64::new(super::DEFAULT_REROUTE_EPOCH_MS),
            sync_epoch_ms: AtomicU64::new(super::DEFAULT_SYNC_EPOCH_MS),
            power_intra: AtomicU8::new(super::DEFAULT_POWER_INTRA),
            power_inter: AtomicU8::new(super::DEFAULT_POWER_INTER),
        }
    }
}

impl Tunables {
    pub fn monitor_sleep_ms(&self) -> u64 {
        self.monitor_sleep_ms.load(Ordering::Relaxed)
    }

    pub fn set_monitor_sleep_ms(&self, ms: u64) {
        self.monitor_sleep_ms.store(ms.max(1), Ordering::Relaxed);
    }

    /// Heartbeat period: a third of the monitoring sleep period
    pub fn heartbeat_ms(&self) -> u64 {
        (self.monitor_sleep_ms() / 3).max(1)
    }

    pub fn reroute_epoch_ms(&self) -> u64 {
        self.reroute_epoch_ms.load(Ordering::Relaxed)
    }

    pub fn set_reroute_epoch_ms(&self, ms: u64) {
        self.reroute_epoch_ms.store(ms.max(1), Ordering::Relaxed);
    }

    pub fn sync_epoch_ms(&self) -> u64 {
        self.sync_epoch_ms.load(Ordering::Relaxed)
    }

    pub fn set_sync_epoch_ms(&self, ms: u64) {
        self.sync_epoch_ms.store(ms.max(1), Ordering::Relaxed);
    }

    pub fn power_intra(&self) -> u8 {
        self.power_intra.load(Ordering::Relaxed)
    }

    pub fn set_power_intra(&self, power: u8) {
        self.power_intra.store(power, Ordering::Relaxed);
    }

    pub fn power_inter(&self) -> u8 {
        self.power_inter.load(Ordering::Relaxed)
    }

    pub fn set_power_inter(&self, power: u8) {
        self.power_inter.store(power, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_node_address_random() {
        let a = NodeAddress::random();
        let b = NodeAddress::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_byte_round_trip() {
        for b in 0..7u8 {
            let state = ProtocolState::from_byte(b).unwrap();
            assert_eq!(state.to_byte(), b);
        }
        assert!(ProtocolState::from_byte(7).is_none());
    }

    #[test]
    fn test_final_overrides_tentative() {
        let mut cluster = ClusterState::default();
        let node = NodeAddress(1);

        cluster.record_claim(node, 5, false);
        assert_eq!(cluster.tentative_count(), 1);
        assert_eq!(cluster.final_count(), 0);

        cluster.record_claim(node, 4, true);
        assert_eq!(cluster.tentative_count(), 0);
        assert_eq!(cluster.final_count(), 1);

        // A later tentative claim must not demote the final one
        cluster.record_claim(node, 6, false);
        assert_eq!(cluster.tentative_count(), 0);
        assert_eq!(cluster.final_count(), 1);
    }

    #[test]
    fn test_pick_min_skips_missing_cost() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut costs = HashMap::new();
        costs.insert(NodeAddress(2), 3);

        // NodeAddress(1) has no cost entry and must be skipped even though
        // "missing" might otherwise sort below 3.
        let picked = pick_min_by_cost(
            [NodeAddress(1), NodeAddress(2)].into_iter(),
            &costs,
            &mut rng,
        );
        assert_eq!(picked, Some(NodeAddress(2)));
    }

    #[test]
    fn test_pick_min_tie_break_stays_within_ties() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut costs = HashMap::new();
        costs.insert(NodeAddress(1), 2);
        costs.insert(NodeAddress(2), 2);
        costs.insert(NodeAddress(3), 9);

        for _ in 0..32 {
            let picked = pick_min_by_cost(
                [NodeAddress(1), NodeAddress(2), NodeAddress(3)].into_iter(),
                &costs,
                &mut rng,
            )
            .unwrap();
            assert!(picked == NodeAddress(1) || picked == NodeAddress(2));
        }
    }

    #[test]
    fn test_tunables_setters() {
        let tunables = Tunables::default();
        tunables.set_monitor_sleep_ms(9_000);
        assert_eq!(tunables.monitor_sleep_ms(), 9_000);
        assert_eq!(tunables.heartbeat_ms(), 3_000);

        tunables.set_power_intra(12);
        assert_eq!(tunables.power_intra(), 12);
    }
}
