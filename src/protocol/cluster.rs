use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use crate::core::{
    ClusterState, NodeAddress, HEED_C, HEED_E_MAX, HEED_P_MIN, MIN_CLAIM_RSSI,
};
use crate::network::monitor::NodeLivenessMonitor;
use crate::network::transport::PacketTransport;
use crate::protocol::message::ControlMessage;

/// Settle delay between election steps
pub const CLUSTER_STEP_MS: u64 = 500;

/// Further delay before step 3 once `p` has reached 1.0
pub const CLUSTER_FINALIZE_MS: u64 = 1_500;

/// What kind of re-route started the election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerouteKind {
    /// Network-wide forced re-route
    Forced,
    /// Single-node recovery
    Add,
}

/// Result of one election step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Re-schedule another step after the settle delay
    Continue,
    /// The `p == 1.0` step has run; schedule finalize
    Settled,
}

/// Election outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This node is a final cluster head
    Head,
    /// This node joins the given head as a member
    Member(NodeAddress),
}

/// The in-progress election round
///
/// All iteration state lives here instead of being threaded through
/// re-scheduled event argument lists. The round id guards against stale
/// step/finalize timers from an aborted round.
#[derive(Debug)]
struct ClusterRound {
    id: u64,
    kind: RerouteKind,
    p: f64,
    final_self: bool,
}

/// HEED-style cluster-head election
///
/// Cost is the count of currently-reachable neighbors; lower is more
/// attractive. The sink never constructs one of these rounds: it is
/// permanently its own head.
pub struct ClusterFormation {
    local: NodeAddress,
    /// Residual energy in [0, E_MAX], fixed at boot
    energy: f64,
    cluster: Arc<Mutex<ClusterState>>,
    monitor: Arc<NodeLivenessMonitor>,
    transport: Arc<PacketTransport>,
    round: Option<ClusterRound>,
    next_round_id: u64,
}

impl ClusterFormation {
    pub fn new(
        local: NodeAddress,
        energy: f64,
        cluster: Arc<Mutex<ClusterState>>,
        monitor: Arc<NodeLivenessMonitor>,
        transport: Arc<PacketTransport>,
    ) -> Self {
        ClusterFormation {
            local,
            energy,
            cluster,
            monitor,
            transport,
            round: None,
            next_round_id: 0,
        }
    }

    /// Initial head probability from residual energy
    pub fn initial_probability(&self) -> f64 {
        (HEED_C * self.energy / HEED_E_MAX).max(HEED_P_MIN)
    }

    /// Starts a fresh round, discarding any round in progress
    ///
    /// Returns the round id to carry in the step/finalize timers.
    pub fn begin(&mut self, kind: RerouteKind) -> u64 {
        let id = self.next_round_id;
        self.next_round_id += 1;
        self.round = Some(ClusterRound {
            id,
            kind,
            p: self.initial_probability(),
            final_self: false,
        });
        debug!(node = %self.local, round = id, ?kind, "election round started");
        id
    }

    /// Kind of the round in progress, if any
    pub fn round_kind(&self) -> Option<RerouteKind> {
        self.round.as_ref().map(|r| r.kind)
    }

    /// Discards the round in progress
    pub fn abort(&mut self) {
        self.round = None;
    }

    /// Runs one election iteration ("step 2")
    ///
    /// Returns `None` when `round_id` is stale.
    pub fn step(&mut self, round_id: u64) -> Option<StepOutcome> {
        let round = self.round.as_mut().filter(|r| r.id == round_id)?;
        let cost = self.monitor.neighbor_count();
        let mut rng = rand::thread_rng();
        let at_one = round.p >= 1.0;

        let claim = {
            let mut cluster = self.cluster.lock().expect("cluster poisoned");
            if cluster.any_head_known() {
                let best = cluster.pick_min_head(&mut rng);
                if best == Some(self.local) && at_one {
                    round.final_self = true;
                    cluster.record_claim(self.local, cost, true);
                    Some(ControlMessage::FinalHead { cost })
                } else {
                    cluster.record_claim(self.local, cost, false);
                    Some(ControlMessage::TentativeHead { cost })
                }
            } else if at_one {
                round.final_self = true;
                cluster.record_claim(self.local, cost, true);
                Some(ControlMessage::FinalHead { cost })
            } else if rng.gen_bool(round.p) {
                cluster.record_claim(self.local, cost, false);
                Some(ControlMessage::TentativeHead { cost })
            } else {
                None
            }
        };

        if let Some(msg) = claim {
            self.transport.broadcast_control(&msg);
        }

        if at_one {
            Some(StepOutcome::Settled)
        } else {
            round.p = (round.p * 2.0).min(1.0);
            Some(StepOutcome::Continue)
        }
    }

    /// Runs "step 3" after the settle delay, ending the round
    ///
    /// Returns `None` when `round_id` is stale.
    pub fn finalize(&mut self, round_id: u64) -> Option<Role> {
        let round = self.round.take_if(|r| r.id == round_id)?;
        let cost = self.monitor.neighbor_count();
        let mut rng = rand::thread_rng();
        let mut cluster = self.cluster.lock().expect("cluster poisoned");

        if !round.final_self {
            if let Some(head) = cluster.pick_min_final(&mut rng).filter(|h| *h != self.local) {
                debug!(node = %self.local, %head, "joining cluster head");
                return Some(Role::Member(head));
            }
        }

        // No usable final head: declare ourselves
        cluster.record_claim(self.local, cost, true);
        drop(cluster);
        self.transport
            .broadcast_control(&ControlMessage::FinalHead { cost });
        debug!(node = %self.local, "self-declared final head");
        Some(Role::Head)
    }

    /// Applies a TENTATIVE/FINAL claim heard over the air
    ///
    /// Claims below the signal-strength threshold are ignored.
    pub fn handle_claim(&self, from: NodeAddress, cost: u32, is_final: bool, rssi: i16) {
        if rssi < MIN_CLAIM_RSSI {
            debug!(%from, rssi, "head claim below signal threshold ignored");
            return;
        }
        self.cluster
            .lock()
            .expect("cluster poisoned")
            .record_claim(from, cost, is_final);
    }

    /// Number of steps a round takes to settle from the initial probability
    pub fn steps_to_settle(&self) -> u32 {
        let mut p = self.initial_probability();
        let mut steps = 1;
        while p < 1.0 {
            p = (p * 2.0).min(1.0);
            steps += 1;
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Clock, SystemClock, Tunables};
    use crate::network::radio::RadioHub;
    use crate::protocol::routing::RoutingTree;
    use crate::protocol::scheduler::ActionScheduler;
    use tokio::sync::mpsc;

    fn formation(energy: f64) -> (ClusterFormation, Arc<Mutex<ClusterState>>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local = NodeAddress(1);
        let hub = RadioHub::new(clock.clone());
        let (radio, _rx) = hub.attach(local);
        let tunables = Arc::new(Tunables::default());
        let monitor = NodeLivenessMonitor::new(clock.clone(), tunables.clone());
        let cluster = Arc::new(Mutex::new(ClusterState::default()));
        let routing = Arc::new(Mutex::new(RoutingTree::new()));
        let scheduler = Arc::new(ActionScheduler::new(clock));
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let transport = PacketTransport::new(
            local, false, radio, monitor.clone(), routing, cluster.clone(), scheduler, tunables,
            app_tx,
        );
        (
            ClusterFormation::new(local, energy, cluster.clone(), monitor, transport),
            cluster,
        )
    }

    #[tokio::test]
    async fn test_initial_probability_bounds() {
        let (full, _) = formation(100.0);
        assert!((full.initial_probability() - HEED_C).abs() < f64::EPSILON);

        let (depleted, _) = formation(0.0);
        assert!((depleted.initial_probability() - HEED_P_MIN).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_round_terminates_in_bounded_steps() {
        let (mut formation, _) = formation(50.0);
        let bound = formation.steps_to_settle();
        let id = formation.begin(RerouteKind::Forced);

        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps <= bound, "election did not settle within {bound} steps");
            match formation.step(id).unwrap() {
                StepOutcome::Continue => {}
                StepOutcome::Settled => break,
            }
        }
        assert_eq!(steps, bound);
    }

    #[tokio::test]
    async fn test_isolated_node_becomes_head() {
        let (mut formation, cluster) = formation(100.0);
        let id = formation.begin(RerouteKind::Forced);
        while formation.step(id).unwrap() == StepOutcome::Continue {}
        assert_eq!(formation.finalize(id), Some(Role::Head));

        let cluster = cluster.lock().unwrap();
        assert!(cluster.is_final(&NodeAddress(1)));
        assert_eq!(cluster.final_count(), 1);
        assert_eq!(cluster.tentative_count(), 0);
    }

    #[tokio::test]
    async fn test_joins_cheaper_final_head() {
        let (mut formation, _cluster) = formation(100.0);
        let id = formation.begin(RerouteKind::Forced);
        // A FINAL head with cost 0 beats our cost (no claim yet recorded,
        // and our own cost only enters once we claim)
        formation.handle_claim(NodeAddress(7), 0, true, -40);
        while formation.step(id).unwrap() == StepOutcome::Continue {}
        assert_eq!(formation.finalize(id), Some(Role::Member(NodeAddress(7))));
    }

    #[tokio::test]
    async fn test_weak_claim_ignored() {
        let (formation, cluster) = formation(100.0);
        formation.handle_claim(NodeAddress(7), 0, true, MIN_CLAIM_RSSI - 1);
        assert!(!cluster.lock().unwrap().is_final(&NodeAddress(7)));

        formation.handle_claim(NodeAddress(7), 0, true, MIN_CLAIM_RSSI);
        assert!(cluster.lock().unwrap().is_final(&NodeAddress(7)));
    }

    #[tokio::test]
    async fn test_stale_round_id_noops() {
        let (mut formation, _) = formation(100.0);
        let old = formation.begin(RerouteKind::Forced);
        let _new = formation.begin(RerouteKind::Add);
        assert!(formation.step(old).is_none());
        assert!(formation.finalize(old).is_none());
    }
}
