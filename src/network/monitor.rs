use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::core::{Clock, NeighborRecord, NodeAddress, Tunables, MAX_NUM_FAILS};
use crate::protocol::event::{EventKind, ProtocolEvent};
use crate::protocol::scheduler::ActionScheduler;

/// Receiver of dead-node notifications
pub trait DeadNodeSink: Send + Sync {
    fn node_dead(&self, node: NodeAddress);
}

/// The coordinator consumes dead-node notices as scheduler events
impl DeadNodeSink for ActionScheduler {
    fn node_dead(&self, node: NodeAddress) {
        let now = self.clock_now();
        self.add(ProtocolEvent::local(now, EventKind::NodeDead { node }));
    }
}

/// Per-neighbor last-seen and failure tracking
///
/// An entry exists while the neighbor is considered reachable: it is created
/// on first reception and removed on staleness or when the consecutive
/// send-failure threshold is reached. Every eviction produces exactly one
/// dead-node notification.
pub struct NodeLivenessMonitor {
    neighbors: Mutex<HashMap<NodeAddress, NeighborRecord>>,
    clock: Arc<dyn Clock>,
    tunables: Arc<Tunables>,
    sink: Mutex<Option<Arc<dyn DeadNodeSink>>>,
}

impl NodeLivenessMonitor {
    pub fn new(clock: Arc<dyn Clock>, tunables: Arc<Tunables>) -> Arc<Self> {
        Arc::new(NodeLivenessMonitor {
            neighbors: Mutex::new(HashMap::new()),
            clock,
            tunables,
            sink: Mutex::new(None),
        })
    }

    /// Wires the dead-node notification sink
    pub fn set_sink(&self, sink: Arc<dyn DeadNodeSink>) {
        *self.sink.lock().expect("monitor sink poisoned") = Some(sink);
    }

    /// Marks a neighbor as just heard from; called for every received frame
    pub fn record_seen(&self, node: NodeAddress) {
        let now = self.clock.now_ms();
        let mut neighbors = self.neighbors.lock().expect("neighbor table poisoned");
        let entry = neighbors.entry(node).or_insert_with(|| {
            debug!(%node, "new neighbor");
            NeighborRecord {
                last_seen: now,
                failures: 0,
            }
        });
        entry.last_seen = now;
    }

    /// Registers one unacknowledged send toward `node`
    ///
    /// Reaching the failure threshold evicts immediately, without waiting
    /// for the sweep.
    pub fn record_failure(&self, node: NodeAddress) {
        let evicted = {
            let mut neighbors = self.neighbors.lock().expect("neighbor table poisoned");
            match neighbors.get_mut(&node) {
                Some(record) => {
                    record.failures += 1;
                    if record.failures >= MAX_NUM_FAILS {
                        neighbors.remove(&node);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if evicted {
            info!(%node, "neighbor evicted after {MAX_NUM_FAILS} consecutive send failures");
            self.notify_dead(node);
        }
    }

    /// Resets the failure counter of `node` only
    pub fn record_success(&self, node: NodeAddress) {
        let mut neighbors = self.neighbors.lock().expect("neighbor table poisoned");
        if let Some(record) = neighbors.get_mut(&node) {
            record.failures = 0;
        }
    }

    /// Whether `node` is currently considered reachable
    pub fn reachable(&self, node: &NodeAddress) -> bool {
        self.neighbors
            .lock()
            .expect("neighbor table poisoned")
            .contains_key(node)
    }

    /// Number of currently reachable neighbors; this is the HEED cost
    pub fn neighbor_count(&self) -> u32 {
        self.neighbors.lock().expect("neighbor table poisoned").len() as u32
    }

    /// Evicts neighbors not heard from for a full sleep period
    ///
    /// Exactly one dead-node notification is emitted per evicted neighbor.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        let max_age = self.tunables.monitor_sleep_ms();
        let evicted: Vec<NodeAddress> = {
            let mut neighbors = self.neighbors.lock().expect("neighbor table poisoned");
            let stale: Vec<NodeAddress> = neighbors
                .iter()
                .filter(|(_, r)| now.saturating_sub(r.last_seen) >= max_age)
                .map(|(n, _)| *n)
                .collect();
            for node in &stale {
                neighbors.remove(node);
            }
            stale
        };
        for node in evicted {
            info!(%node, "neighbor evicted as stale");
            self.notify_dead(node);
        }
    }

    /// Periodic sweep task; one per node, independent of the coordinator
    pub async fn run(self: Arc<Self>) {
        loop {
            let sleep = self.tunables.monitor_sleep_ms();
            tokio::time::sleep(Duration::from_millis(sleep)).await;
            self.sweep();
        }
    }

    fn notify_dead(&self, node: NodeAddress) {
        let sink = self.sink.lock().expect("monitor sink poisoned").clone();
        if let Some(sink) = sink {
            sink.node_dead(node);
        }
    }
}
