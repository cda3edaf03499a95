//! Per-node context wiring every subsystem together
//!
//! A [`Node`] owns its scheduler, liveness monitor, transport, coordinator
//! and time-sync service. Nothing is process-wide, so one test process can
//! run a whole simulated mesh over a [`RadioHub`].
//!
//! Upward delivery is best-effort: the consumer of the receive stream must
//! re-request data it misses.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::{
    Clock, ClusterState, NodeAddress, Result, SystemClock, Tunables,
    DEFAULT_MONITOR_SLEEP_MS, HEED_E_MAX,
};
use crate::network::monitor::NodeLivenessMonitor;
use crate::network::radio::{Radio, RxFrame};
use crate::network::transport::{ForwardMode, PacketTransport};
use crate::protocol::coordinator::ProtocolCoordinator;
use crate::protocol::event::{EventKind, ProtocolEvent};
use crate::protocol::routing::RoutingTree;
use crate::protocol::scheduler::ActionScheduler;
use crate::sync::{SyncedClock, TimeSyncService};

/// Boot parameters for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub address: NodeAddress,
    /// The single tree root; boots routed at depth 0
    pub is_sink: bool,
    /// Residual energy in [0, E_MAX], feeds the head election probability
    pub energy: f64,
    /// Liveness sweep period; also sets the heartbeat at a third of it
    pub monitor_sleep_ms: u64,
}

impl NodeConfig {
    pub fn new(address: NodeAddress) -> Self {
        NodeConfig {
            address,
            is_sink: false,
            energy: HEED_E_MAX,
            monitor_sleep_ms: DEFAULT_MONITOR_SLEEP_MS,
        }
    }

    pub fn sink(address: NodeAddress) -> Self {
        NodeConfig {
            address,
            is_sink: true,
            energy: HEED_E_MAX,
            monitor_sleep_ms: DEFAULT_MONITOR_SLEEP_MS,
        }
    }
}

/// A running mesh node
pub struct Node {
    address: NodeAddress,
    tunables: Arc<Tunables>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<ActionScheduler>,
    monitor: Arc<NodeLivenessMonitor>,
    routing: Arc<Mutex<RoutingTree>>,
    transport: Arc<PacketTransport>,
    sync: Arc<TimeSyncService>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Boots a node on the given radio and returns it together with the
    /// application receive stream of `(payload, source)` pairs
    pub fn start(
        config: NodeConfig,
        radio: Arc<dyn Radio>,
        mut radio_rx: mpsc::UnboundedReceiver<RxFrame>,
    ) -> (Node, mpsc::UnboundedReceiver<(Vec<u8>, NodeAddress)>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tunables = Arc::new(Tunables::default());
        tunables.set_monitor_sleep_ms(config.monitor_sleep_ms);
        let scheduler = Arc::new(ActionScheduler::new(clock.clone()));
        let monitor = NodeLivenessMonitor::new(clock.clone(), tunables.clone());
        monitor.set_sink(scheduler.clone());
        let routing = Arc::new(Mutex::new(if config.is_sink {
            RoutingTree::sink()
        } else {
            RoutingTree::new()
        }));
        let cluster = Arc::new(Mutex::new(ClusterState::default()));
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        let transport = PacketTransport::new(
            config.address,
            config.is_sink,
            radio,
            monitor.clone(),
            routing.clone(),
            cluster.clone(),
            scheduler.clone(),
            tunables.clone(),
            app_tx,
        );
        let sync = TimeSyncService::new(
            config.address,
            config.is_sink,
            clock.clone(),
            routing.clone(),
            transport.clone(),
            scheduler.clone(),
        );
        let coordinator = ProtocolCoordinator::new(
            config.address,
            config.is_sink,
            config.energy,
            cluster,
            routing.clone(),
            monitor.clone(),
            transport.clone(),
            scheduler.clone(),
            sync.clone(),
            clock.clone(),
            tunables.clone(),
        );

        let mut tasks = Vec::new();
        // Inbound pump: radio frames into events and upward deliveries
        let rx_transport = transport.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = radio_rx.recv().await {
                rx_transport.handle_rx(frame);
            }
        }));
        tasks.push(tokio::spawn(coordinator.run()));
        tasks.push(tokio::spawn(monitor.clone().run()));

        info!(node = %config.address, sink = config.is_sink, "node started");
        (
            Node {
                address: config.address,
                tunables,
                clock,
                scheduler,
                monitor,
                routing,
                transport,
                sync,
                tasks,
            },
            app_rx,
        )
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// The node's effective (sync-corrected) clock
    pub fn clock(&self) -> Arc<SyncedClock> {
        self.sync.synced()
    }

    // ----- upper-layer sends -----

    /// One hop up the tree
    pub fn send_to_parent(&self, payload: &[u8]) -> Result<()> {
        self.transport
            .send_application(ForwardMode::ToParent, true, false, payload)
    }

    /// Up the tree, delivered at every hop until the sink
    pub fn send_to_ancestors(&self, payload: &[u8]) -> Result<()> {
        self.transport
            .send_application(ForwardMode::ToParent, true, true, payload)
    }

    /// One hop down to the routing and cluster children
    pub fn send_to_children(&self, payload: &[u8]) -> Result<()> {
        self.transport
            .send_application(ForwardMode::ToChildren, true, false, payload)
    }

    /// Down the whole subtree
    pub fn send_to_descendants(&self, payload: &[u8]) -> Result<()> {
        self.transport
            .send_application(ForwardMode::ToChildrenBroadcast, true, true, payload)
    }

    /// Everyone in radio range, tree or not
    pub fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        self.transport
            .send_application(ForwardMode::Broadcast, true, false, payload)
    }

    // ----- tree observation -----

    pub fn parent(&self) -> Option<NodeAddress> {
        self.routing.lock().expect("routing poisoned").parent()
    }

    pub fn children(&self) -> Vec<NodeAddress> {
        self.routing
            .lock()
            .expect("routing poisoned")
            .children()
            .collect()
    }

    pub fn height(&self) -> u16 {
        self.routing.lock().expect("routing poisoned").height()
    }

    pub fn depth(&self) -> Option<u16> {
        self.routing.lock().expect("routing poisoned").depth()
    }

    /// Count of currently-reachable neighbors
    pub fn neighbor_count(&self) -> u32 {
        self.monitor.neighbor_count()
    }

    // ----- control -----

    /// Triggers a network-wide forced re-route, subject to the suppression
    /// window
    pub fn force_reroute(&self) {
        self.scheduler.add(ProtocolEvent::local(
            self.clock.now_ms(),
            EventKind::ForcedReroute,
        ));
    }

    pub fn set_power_intra(&self, power: u8) {
        self.tunables.set_power_intra(power);
    }

    pub fn set_power_inter(&self, power: u8) {
        self.tunables.set_power_inter(power);
    }

    pub fn set_reroute_epoch_ms(&self, ms: u64) {
        self.tunables.set_reroute_epoch_ms(ms);
    }

    pub fn set_monitor_sleep_ms(&self, ms: u64) {
        self.tunables.set_monitor_sleep_ms(ms);
    }

    pub fn set_sync_epoch_ms(&self, ms: u64) {
        self.tunables.set_sync_epoch_ms(ms);
    }

    /// Stops all background tasks
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
