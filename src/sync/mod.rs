//! Round-trip time synchronization down the routing tree
//!
//! Only the sink initiates, once per sync epoch or on demand after a
//! re-route. Per hop the parent sends `Request { t1 }`; the child stamps the
//! link-layer arrival `t2` and answers `Reply { t1, t2, t3 }`; the parent
//! stamps arrival `t4`, computes `d2 = ((t2 - t1) - (t4 - t3)) / 2` and
//! returns `Adjust { t2, d2 }`, from which the child derives its clock
//! correction. After a child is adjusted it receives `Descend` and repeats
//! the exchange over its own children, so propagation is bounded by tree
//! height. The computation assumes symmetric one-way delay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::core::{Clock, NodeAddress};
use crate::network::transport::PacketTransport;
use crate::protocol::event::{EventKind, Origin, ProtocolEvent};
use crate::protocol::message::SyncMessage;
use crate::protocol::routing::RoutingTree;
use crate::protocol::scheduler::ActionScheduler;

/// How long to wait for a `Reply` before rotating to the next child
pub const SYNC_REPLY_TIMEOUT_MS: u64 = 2_000;

/// Retry budget per sync round
pub const SYNC_MAX_RETRIES: u32 = 10;

/// The raw clock plus the accumulated sync correction
///
/// `now_ms` is the node's effective protocol time. The delta is recomputed
/// by every completed exchange with the parent, so it also converges again
/// after the parent changes.
pub struct SyncedClock {
    raw: Arc<dyn Clock>,
    delta: AtomicI64,
}

impl SyncedClock {
    pub fn new(raw: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(SyncedClock {
            raw,
            delta: AtomicI64::new(0),
        })
    }

    /// Effective time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.from_raw(self.raw.now_ms())
    }

    /// Converts a raw clock stamp (e.g. a link-layer arrival) to effective time
    pub fn from_raw(&self, raw_ms: u64) -> u64 {
        let adjusted = raw_ms as i64 + self.delta.load(Ordering::SeqCst);
        adjusted.max(0) as u64
    }

    /// Current correction in milliseconds
    pub fn delta_ms(&self) -> i64 {
        self.delta.load(Ordering::SeqCst)
    }

    /// Applies an incremental correction
    pub fn adjust(&self, correction_ms: i64) {
        self.delta.fetch_add(correction_ms, Ordering::SeqCst);
    }
}

impl Clock for SyncedClock {
    fn now_ms(&self) -> u64 {
        SyncedClock::now_ms(self)
    }
}

/// One in-progress sync sweep over the local children
struct SyncRound {
    /// Generation of the outstanding request; stale retry timers no-op
    generation: u64,
    /// Children still to be synchronized
    pending: VecDeque<NodeAddress>,
    /// Child the outstanding request went to, with its `t1`
    current: Option<(NodeAddress, u64)>,
    retries: u32,
}

struct SyncInner {
    round: Option<SyncRound>,
    next_generation: u64,
    /// Our stamped arrival of the last `Request`, awaiting the `Adjust`
    last_t2: Option<u64>,
}

/// Drives the per-hop exchange for one node
pub struct TimeSyncService {
    local: NodeAddress,
    clock: Arc<dyn Clock>,
    synced: Arc<SyncedClock>,
    routing: Arc<Mutex<RoutingTree>>,
    transport: Arc<PacketTransport>,
    scheduler: Arc<ActionScheduler>,
    inner: Mutex<SyncInner>,
}

impl TimeSyncService {
    pub fn new(
        local: NodeAddress,
        _is_sink: bool,
        clock: Arc<dyn Clock>,
        routing: Arc<Mutex<RoutingTree>>,
        transport: Arc<PacketTransport>,
        scheduler: Arc<ActionScheduler>,
    ) -> Arc<Self> {
        let synced = SyncedClock::new(clock.clone());
        Arc::new(TimeSyncService {
            local,
            clock,
            synced,
            routing,
            transport,
            scheduler,
            inner: Mutex::new(SyncInner {
                round: None,
                next_generation: 0,
                last_t2: None,
            }),
        })
    }

    /// The effective clock of this node
    pub fn synced(&self) -> Arc<SyncedClock> {
        self.synced.clone()
    }

    /// True while a sweep over the children is outstanding
    pub fn in_progress(&self) -> bool {
        self.inner.lock().expect("sync poisoned").round.is_some()
    }

    /// Starts a sweep over the current children
    pub fn start_round(self: &Arc<Self>) {
        let children: VecDeque<NodeAddress> = self
            .routing
            .lock()
            .expect("routing poisoned")
            .children()
            .collect();
        if children.is_empty() {
            debug!(node = %self.local, "no children to synchronize");
            return;
        }
        let mut inner = self.inner.lock().expect("sync poisoned");
        inner.round = Some(SyncRound {
            generation: 0,
            pending: children,
            current: None,
            retries: 0,
        });
        self.send_next(&mut inner);
    }

    /// Starts (or extends) a sweep covering just `child`
    ///
    /// Run when a child attaches, so its delta is recomputed on every parent
    /// change instead of waiting out the sync epoch.
    pub fn sync_child(self: &Arc<Self>, child: NodeAddress) {
        let mut inner = self.inner.lock().expect("sync poisoned");
        if let Some(round) = inner.round.as_mut() {
            let already_queued = round.pending.contains(&child)
                || round.current.is_some_and(|(c, _)| c == child);
            if !already_queued {
                round.pending.push_back(child);
            }
            return;
        }
        inner.round = Some(SyncRound {
            generation: 0,
            pending: VecDeque::from([child]),
            current: None,
            retries: 0,
        });
        self.send_next(&mut inner);
    }

    /// Sends the request to the next pending child, arming the retry timer
    ///
    /// Clears the round when no children remain.
    fn send_next(self: &Arc<Self>, inner: &mut SyncInner) {
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let Some(round) = inner.round.as_mut() else {
            return;
        };
        let Some(child) = round.pending.pop_front() else {
            info!(node = %self.local, "time sync sweep complete");
            inner.round = None;
            return;
        };
        round.generation = generation;
        let t1 = self.synced.now_ms();
        round.current = Some((child, t1));

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service
                .transport
                .unicast_sync(child, &SyncMessage::Request { t1 })
            {
                debug!(node = %service.local, %child, error = %e, "sync request dropped");
            }
        });
        self.scheduler.add(ProtocolEvent::local(
            self.clock.now_ms() + SYNC_REPLY_TIMEOUT_MS,
            EventKind::SyncRetry { generation },
        ));
    }

    /// Handles a received time-sync frame; `arrival` is the raw link-layer
    /// stamp of the frame
    pub fn handle_message(self: &Arc<Self>, origin: Option<Origin>, arrival: u64, msg: SyncMessage) {
        let Some(origin) = origin else {
            debug!(node = %self.local, "sync frame without origin dropped");
            return;
        };
        match msg {
            SyncMessage::Request { t1 } => self.answer_request(origin.node, arrival, t1),
            SyncMessage::Reply { t1, t2, t3 } => self.complete_exchange(origin.node, arrival, t1, t2, t3),
            SyncMessage::Adjust { t2, d2 } => self.apply_adjust(origin.node, t2, d2),
            SyncMessage::Descend => self.start_round(),
        }
    }

    fn answer_request(self: &Arc<Self>, from: NodeAddress, arrival: u64, t1: u64) {
        let t2 = self.synced.from_raw(arrival);
        self.inner.lock().expect("sync poisoned").last_t2 = Some(t2);
        let t3 = self.synced.now_ms();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service
                .transport
                .unicast_sync(from, &SyncMessage::Reply { t1, t2, t3 })
            {
                debug!(node = %service.local, parent = %from, error = %e, "sync reply dropped");
            }
        });
    }

    fn complete_exchange(
        self: &Arc<Self>,
        from: NodeAddress,
        arrival: u64,
        t1: u64,
        t2: u64,
        t3: u64,
    ) {
        let mut inner = self.inner.lock().expect("sync poisoned");
        let matches = inner
            .round
            .as_ref()
            .and_then(|r| r.current)
            .is_some_and(|(child, sent_t1)| child == from && sent_t1 == t1);
        if !matches {
            debug!(node = %self.local, %from, "unexpected sync reply dropped");
            return;
        }

        let t4 = self.synced.from_raw(arrival);
        let d2 = ((t2 as i64 - t1 as i64) - (t4 as i64 - t3 as i64)) / 2;
        debug!(node = %self.local, child = %from, d2, "sync exchange complete");

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service
                .transport
                .unicast_sync(from, &SyncMessage::Adjust { t2, d2 })
            {
                debug!(node = %service.local, child = %from, error = %e, "sync adjust dropped");
                return;
            }
            // Once adjusted, the child covers its own subtree
            if let Err(e) = service.transport.unicast_sync(from, &SyncMessage::Descend) {
                debug!(node = %service.local, child = %from, error = %e, "sync descend dropped");
            }
        });

        if let Some(round) = inner.round.as_mut() {
            round.current = None;
        }
        self.send_next(&mut inner);
    }

    fn apply_adjust(&self, from: NodeAddress, t2: u64, d2: i64) {
        let last_t2 = self.inner.lock().expect("sync poisoned").last_t2.take();
        let Some(local_t2) = last_t2 else {
            debug!(node = %self.local, %from, "adjust without pending exchange dropped");
            return;
        };
        let correction = -(d2 + (local_t2 as i64 - t2 as i64));
        self.synced.adjust(correction);
        info!(node = %self.local, correction, delta = self.synced.delta_ms(), "clock adjusted");
    }

    /// The retry timer for an outstanding request fired
    pub fn handle_retry(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock().expect("sync poisoned");
        let Some(round) = inner.round.as_mut() else {
            return;
        };
        if round.generation != generation || round.current.is_none() {
            // The reply arrived in time; nothing to do
            return;
        }
        round.retries += 1;
        if round.retries > SYNC_MAX_RETRIES {
            warn!(node = %self.local, "time sync round abandoned after retries");
            inner.round = None;
            return;
        }
        // Rotate the silent child to the back and try the next one
        let (child, _) = round.current.take().expect("checked above");
        round.pending.push_back(child);
        debug!(node = %self.local, %child, retry = round.retries, "sync reply missing, rotating");
        self.send_next(&mut inner);
    }
}
