use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::{
    ClusterState, Error, NodeAddress, Result, Tunables, DEDUP_RING_SIZE, PROTO_CONTROL,
    PROTO_DATA, PROTO_TIMESYNC, SEND_RETRIES, SEND_RETRIES_FRAGMENTED,
};
use crate::network::monitor::NodeLivenessMonitor;
use crate::network::radio::{Radio, RxFrame};
use crate::protocol::event::{EventKind, ProtocolEvent};
use crate::protocol::message::{ControlMessage, SyncMessage};
use crate::protocol::routing::RoutingTree;
use crate::protocol::scheduler::ActionScheduler;

/// Forwarding mode carried in byte 0 of the application envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Deliver on every receiver in range
    Broadcast,
    /// Radio broadcast filtered to the sender's children
    ToChildrenBroadcast,
    /// Unicast down the tree to each routing and cluster child
    ToChildren,
    /// Up the tree toward the sink
    ToParent,
}

impl ForwardMode {
    fn to_byte(self) -> u8 {
        match self {
            ForwardMode::Broadcast => 0,
            ForwardMode::ToChildrenBroadcast => 1,
            ForwardMode::ToChildren => 2,
            ForwardMode::ToParent => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ForwardMode::Broadcast),
            1 => Some(ForwardMode::ToChildrenBroadcast),
            2 => Some(ForwardMode::ToChildren),
            3 => Some(ForwardMode::ToParent),
            _ => None,
        }
    }
}

/// Partially reassembled fragmented frame
struct Partial {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Packet dispatch, duplicate suppression and retrying sends
///
/// All frames enter through `handle_rx`: control frames become scheduler
/// events, application envelopes are deduplicated, forwarded per their
/// mode byte, and delivered upward decompressed. All outbound traffic
/// leaves through here as well.
pub struct PacketTransport {
    local: NodeAddress,
    is_sink: bool,
    radio: Arc<dyn Radio>,
    monitor: Arc<NodeLivenessMonitor>,
    routing: Arc<Mutex<RoutingTree>>,
    cluster: Arc<Mutex<ClusterState>>,
    scheduler: Arc<ActionScheduler>,
    tunables: Arc<Tunables>,
    app_tx: mpsc::UnboundedSender<(Vec<u8>, NodeAddress)>,
    dedup: Mutex<VecDeque<u64>>,
    reassembly: Mutex<HashMap<(NodeAddress, u16), Partial>>,
    seq: AtomicU16,
}

impl PacketTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: NodeAddress,
        is_sink: bool,
        radio: Arc<dyn Radio>,
        monitor: Arc<NodeLivenessMonitor>,
        routing: Arc<Mutex<RoutingTree>>,
        cluster: Arc<Mutex<ClusterState>>,
        scheduler: Arc<ActionScheduler>,
        tunables: Arc<Tunables>,
        app_tx: mpsc::UnboundedSender<(Vec<u8>, NodeAddress)>,
    ) -> Arc<Self> {
        Arc::new(PacketTransport {
            local,
            is_sink,
            radio,
            monitor,
            routing,
            cluster,
            scheduler,
            tunables,
            app_tx,
            dedup: Mutex::new(VecDeque::with_capacity(DEDUP_RING_SIZE)),
            reassembly: Mutex::new(HashMap::new()),
            seq: AtomicU16::new(0),
        })
    }

    // ----- outbound control -----

    /// Broadcasts a control frame; broadcast is unacknowledged
    pub fn broadcast_control(&self, msg: &ControlMessage) {
        self.radio.set_power(self.tunables.power_inter());
        if let Err(e) = self.radio.broadcast(PROTO_CONTROL, &msg.encode()) {
            debug!(error = %e, "control broadcast failed");
        }
    }

    /// Unicasts a control frame with the single-frame retry budget
    pub fn unicast_control(&self, dest: NodeAddress, msg: &ControlMessage) -> Result<()> {
        self.unicast_with_retries(dest, PROTO_CONTROL, &msg.encode(), SEND_RETRIES)
    }

    /// Unicasts a control frame on a short-lived worker task
    ///
    /// The coordinator must never block on radio I/O; loss is handled by
    /// timeouts and heartbeats, not by surfacing the send result.
    pub fn spawn_unicast_control(self: &Arc<Self>, dest: NodeAddress, msg: ControlMessage) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = transport.unicast_control(dest, &msg) {
                debug!(%dest, error = %e, "control unicast dropped");
            }
        });
    }

    /// Unicasts a time-sync frame with the single-frame retry budget
    pub fn unicast_sync(&self, dest: NodeAddress, msg: &SyncMessage) -> Result<()> {
        self.unicast_with_retries(dest, PROTO_TIMESYNC, &msg.encode(), SEND_RETRIES)
    }

    // ----- outbound application data -----

    /// Wraps, compresses and sends an application payload
    pub fn send_application(
        &self,
        mode: ForwardMode,
        deliver_locally: bool,
        propagate: bool,
        payload: &[u8],
    ) -> Result<()> {
        let envelope = encode_envelope(mode, deliver_locally, propagate, payload)?;
        match mode {
            ForwardMode::Broadcast | ForwardMode::ToChildrenBroadcast => {
                self.broadcast_data(&envelope);
                Ok(())
            }
            ForwardMode::ToChildren => {
                for child in self.down_targets() {
                    if let Err(e) = self.unicast_data(child, &envelope) {
                        debug!(%child, error = %e, "child send dropped");
                    }
                }
                Ok(())
            }
            ForwardMode::ToParent => {
                let parent = self
                    .routing
                    .lock()
                    .expect("routing poisoned")
                    .parent()
                    .ok_or_else(|| Error::routing("no parent"))?;
                self.unicast_data(parent, &envelope)
            }
        }
    }

    /// Unicasts a complete envelope, fragmenting when it exceeds the MTU
    ///
    /// The fragmented path carries a larger per-fragment retry budget.
    fn unicast_data(&self, dest: NodeAddress, envelope: &[u8]) -> Result<()> {
        let frames = self.to_frames(envelope);
        let budget = if frames.len() > 1 {
            SEND_RETRIES_FRAGMENTED
        } else {
            SEND_RETRIES
        };
        for frame in frames {
            self.unicast_with_retries(dest, PROTO_DATA, &frame, budget)?;
        }
        Ok(())
    }

    fn broadcast_data(&self, envelope: &[u8]) {
        self.radio.set_power(self.tunables.power_inter());
        for frame in self.to_frames(envelope) {
            if let Err(e) = self.radio.broadcast(PROTO_DATA, &frame) {
                debug!(error = %e, "data broadcast failed");
            }
        }
    }

    /// Splits an envelope into sequenced radio frames
    ///
    /// Frame layout: seq (u16) | index (u8) | count (u8) | chunk.
    fn to_frames(&self, envelope: &[u8]) -> Vec<Vec<u8>> {
        let chunk_size = self.radio.mtu().saturating_sub(4).max(1);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let count = envelope.len().div_ceil(chunk_size).max(1);
        let mut frames = Vec::with_capacity(count);
        for (idx, chunk) in envelope.chunks(chunk_size).enumerate() {
            let mut frame = BytesMut::with_capacity(4 + chunk.len());
            frame.put_u16(seq);
            frame.put_u8(idx as u8);
            frame.put_u8(count as u8);
            frame.put_slice(chunk);
            frames.push(frame.to_vec());
        }
        if frames.is_empty() {
            // Zero-length envelope still produces one frame
            let mut frame = BytesMut::with_capacity(4);
            frame.put_u16(seq);
            frame.put_u8(0);
            frame.put_u8(1);
            frames.push(frame.to_vec());
        }
        frames
    }

    /// Retrying unicast against a known-reachable destination
    ///
    /// Each failed attempt is registered with the liveness monitor; the
    /// first success resets the destination's failure counter.
    fn unicast_with_retries(
        &self,
        dest: NodeAddress,
        proto: u8,
        frame: &[u8],
        budget: u32,
    ) -> Result<()> {
        if !self.monitor.reachable(&dest) {
            return Err(Error::transport(format!("{dest} is not a known neighbor")));
        }
        self.radio.set_power(self.tunables.power_intra());
        for _ in 0..budget {
            match self.radio.unicast(dest, proto, frame) {
                Ok(()) => {
                    self.monitor.record_success(dest);
                    return Ok(());
                }
                Err(_) => self.monitor.record_failure(dest),
            }
        }
        Err(Error::transport(format!("retry budget exhausted for {dest}")))
    }

    // ----- inbound -----

    /// Entry point for every frame handed up by the radio
    pub fn handle_rx(&self, frame: RxFrame) {
        self.monitor.record_seen(frame.from);
        match frame.proto {
            PROTO_CONTROL => match ControlMessage::decode(&frame.bytes) {
                Ok(msg) => self.scheduler.add(ProtocolEvent::received(
                    frame.arrival,
                    frame.from,
                    frame.rssi,
                    EventKind::Control(msg),
                )),
                Err(e) => debug!(from = %frame.from, error = %e, "bad control frame dropped"),
            },
            PROTO_TIMESYNC => match SyncMessage::decode(&frame.bytes) {
                Ok(msg) => self.scheduler.add(ProtocolEvent::received(
                    frame.arrival,
                    frame.from,
                    frame.rssi,
                    EventKind::Sync(msg),
                )),
                Err(e) => debug!(from = %frame.from, error = %e, "bad sync frame dropped"),
            },
            PROTO_DATA => {
                if let Some(envelope) = self.reassemble(frame.from, &frame.bytes) {
                    self.process_envelope(&envelope, frame.from);
                }
            }
            other => debug!(proto = other, "frame on unknown protocol dropped"),
        }
    }

    /// Collects data frames into complete envelopes
    fn reassemble(&self, from: NodeAddress, bytes: &[u8]) -> Option<Vec<u8>> {
        if bytes.len() < 4 {
            debug!(%from, "short data frame dropped");
            return None;
        }
        let mut buf = bytes;
        let seq = buf.get_u16();
        let idx = buf.get_u8() as usize;
        let count = buf.get_u8() as usize;
        if count == 0 || idx >= count {
            debug!(%from, "malformed fragment header dropped");
            return None;
        }
        if count == 1 {
            return Some(buf.to_vec());
        }

        let mut reassembly = self.reassembly.lock().expect("reassembly poisoned");
        let partial = reassembly.entry((from, seq)).or_insert_with(|| Partial {
            chunks: vec![None; count],
            received: 0,
        });
        if partial.chunks.len() != count {
            // Conflicting fragment counts for one sequence; start over
            *partial = Partial {
                chunks: vec![None; count],
                received: 0,
            };
        }
        if partial.chunks[idx].is_none() {
            partial.chunks[idx] = Some(buf.to_vec());
            partial.received += 1;
        }
        if partial.received < count {
            return None;
        }
        let partial = reassembly.remove(&(from, seq))?;
        let mut envelope = Vec::new();
        for chunk in partial.chunks {
            envelope.extend_from_slice(&chunk?);
        }
        Some(envelope)
    }

    /// Applies dedup and per-mode forwarding rules to a complete envelope
    fn process_envelope(&self, envelope: &[u8], from: NodeAddress) {
        if envelope.len() < 3 {
            debug!(%from, "short envelope dropped");
            return;
        }
        let Some(mode) = ForwardMode::from_byte(envelope[0]) else {
            debug!(%from, mode = envelope[0], "unknown forwarding mode dropped");
            return;
        };
        let deliver_locally = envelope[1] != 0;
        let propagate = envelope[2] != 0;
        let payload = &envelope[3..];

        // Duplicate suppression happens before any forwarding decision. The
        // hash is remembered only once a frame passes the relationship
        // checks: an overheard copy from a non-parent must not suppress the
        // copy later relayed by the actual parent.
        let Some(hash) = self.dedup_check(payload) else {
            debug!(%from, "duplicate payload suppressed");
            return;
        };

        let parent = self.routing.lock().expect("routing poisoned").parent();
        match mode {
            ForwardMode::Broadcast => {
                self.dedup_record(hash);
                if deliver_locally {
                    self.deliver(payload, from);
                }
            }
            ForwardMode::ToChildrenBroadcast => {
                if parent != Some(from) {
                    debug!(%from, "to-children broadcast from non-parent dropped");
                    return;
                }
                self.dedup_record(hash);
                if deliver_locally {
                    self.deliver(payload, from);
                }
                if propagate {
                    self.broadcast_data(envelope);
                }
            }
            ForwardMode::ToChildren => {
                if parent != Some(from) {
                    debug!(%from, "to-children frame from non-parent dropped");
                    return;
                }
                self.dedup_record(hash);
                if deliver_locally {
                    self.deliver(payload, from);
                }
                if propagate {
                    for child in self.down_targets() {
                        if let Err(e) = self.unicast_data(child, envelope) {
                            debug!(%child, error = %e, "downward forward dropped");
                        }
                    }
                }
            }
            ForwardMode::ToParent => {
                if self.is_sink {
                    // The sink is the destination of all upward traffic
                    self.dedup_record(hash);
                    self.deliver(payload, from);
                    return;
                }
                let is_child = {
                    let routing = self.routing.lock().expect("routing poisoned");
                    let cluster = self.cluster.lock().expect("cluster poisoned");
                    routing.has_child(&from) || cluster.members().any(|m| m == from)
                };
                if !is_child {
                    // Stale relationship claim: correct it explicitly
                    warn!(%from, "upward traffic from non-child, sending correction");
                    let _ = self.unicast_control(from, &ControlMessage::NotYourParent);
                    return;
                }
                self.dedup_record(hash);
                if deliver_locally {
                    self.deliver(payload, from);
                }
                if propagate {
                    if let Some(parent) = parent {
                        if let Err(e) = self.unicast_data(parent, envelope) {
                            debug!(%parent, error = %e, "upward forward dropped");
                        }
                    }
                }
            }
        }
    }

    /// Routing children plus cluster members
    fn down_targets(&self) -> Vec<NodeAddress> {
        let routing = self.routing.lock().expect("routing poisoned");
        let cluster = self.cluster.lock().expect("cluster poisoned");
        let mut targets: Vec<NodeAddress> = routing.children().collect();
        for member in cluster.members() {
            if !targets.contains(&member) {
                targets.push(member);
            }
        }
        targets
    }

    /// Consults the payload-hash ring; `None` means already seen
    ///
    /// A hash collision falsely suppressing a fresh payload is accepted.
    fn dedup_check(&self, payload: &[u8]) -> Option<u64> {
        let mut hasher = DefaultHasher::new();
        hasher.write(payload);
        let hash = hasher.finish();

        let ring = self.dedup.lock().expect("dedup ring poisoned");
        if ring.contains(&hash) {
            None
        } else {
            Some(hash)
        }
    }

    fn dedup_record(&self, hash: u64) {
        let mut ring = self.dedup.lock().expect("dedup ring poisoned");
        if ring.contains(&hash) {
            return;
        }
        if ring.len() == DEDUP_RING_SIZE {
            ring.pop_front();
        }
        ring.push_back(hash);
    }

    fn deliver(&self, compressed: &[u8], from: NodeAddress) {
        match decompress(compressed) {
            Ok(payload) => {
                // Best-effort upward: a vanished consumer is not an error
                let _ = self.app_tx.send((payload, from));
            }
            Err(e) => warn!(%from, error = %e, "undecodable payload dropped"),
        }
    }
}

/// Builds the 3-byte header + deflate-compressed payload envelope
fn encode_envelope(
    mode: ForwardMode,
    deliver_locally: bool,
    propagate: bool,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut envelope = vec![
        mode.to_byte(),
        u8::from(deliver_locally),
        u8::from(propagate),
    ];
    let mut encoder = DeflateEncoder::new(&mut envelope, Compression::default());
    encoder
        .write_all(payload)
        .and_then(|_| encoder.finish().map(|_| ()))
        .map_err(|e| Error::transport(format!("compression failed: {e}")))?;
    Ok(envelope)
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(compressed);
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| Error::transport(format!("decompression failed: {e}")))?;
    Ok(payload)
}
