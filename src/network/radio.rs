use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::core::{Clock, Error, NodeAddress, Result, MAX_FRAME_SIZE};

/// A frame handed up by the radio
#[derive(Debug, Clone)]
pub struct RxFrame {
    /// Originator address reported by the radio
    pub from: NodeAddress,
    /// Received signal strength
    pub rssi: i16,
    /// Link-layer arrival timestamp in raw clock milliseconds
    pub arrival: u64,
    /// Radio protocol number the frame was received on
    pub proto: u8,
    /// Frame contents
    pub bytes: Vec<u8>,
}

/// The radio MAC/PHY primitive the protocol is built on
///
/// Best-effort only: `Ok` means the radio accepted the frame, an `Err`
/// means busy channel or missing acknowledgement. Errors never reach
/// protocol logic directly; they only feed the liveness failure counters.
/// Reception arrives as an `RxFrame` stream handed out at attach time.
pub trait Radio: Send + Sync + 'static {
    /// Sends a frame to a single destination
    fn unicast(&self, dest: NodeAddress, proto: u8, frame: &[u8]) -> Result<()>;

    /// Sends a frame to everyone in range
    fn broadcast(&self, proto: u8, frame: &[u8]) -> Result<()>;

    /// Adjusts transmit power for subsequent sends
    fn set_power(&self, power: u8);

    /// Largest frame the radio accepts
    fn mtu(&self) -> usize {
        MAX_FRAME_SIZE
    }
}

struct HubInner {
    endpoints: HashMap<NodeAddress, mpsc::UnboundedSender<RxFrame>>,
    /// Symmetric severed links, stored with the smaller address first
    cut_links: HashSet<(NodeAddress, NodeAddress)>,
    /// Nodes that neither send nor receive (simulated death)
    silenced: HashSet<NodeAddress>,
}

/// In-process radio medium connecting simulated nodes
///
/// Every attached node hears every other attached node unless a link is cut
/// or a node is silenced. There are no process-wide singletons: build one
/// hub per test and attach as many nodes as needed.
pub struct RadioHub {
    inner: Mutex<HubInner>,
    clock: Arc<dyn Clock>,
    rssi: i16,
}

impl RadioHub {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(RadioHub {
            inner: Mutex::new(HubInner {
                endpoints: HashMap::new(),
                cut_links: HashSet::new(),
                silenced: HashSet::new(),
            }),
            clock,
            rssi: -50,
        })
    }

    /// Attaches a node, returning its radio endpoint and receive stream
    pub fn attach(
        self: &Arc<Self>,
        addr: NodeAddress,
    ) -> (Arc<HubRadio>, mpsc::UnboundedReceiver<RxFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("radio hub poisoned")
            .endpoints
            .insert(addr, tx);
        (
            Arc::new(HubRadio {
                hub: Arc::clone(self),
                local: addr,
            }),
            rx,
        )
    }

    /// Severs the link between two nodes in both directions
    pub fn cut_link(&self, a: NodeAddress, b: NodeAddress) {
        let key = if a < b { (a, b) } else { (b, a) };
        self.inner
            .lock()
            .expect("radio hub poisoned")
            .cut_links
            .insert(key);
    }

    /// Stops all traffic to and from a node
    pub fn silence(&self, addr: NodeAddress) {
        self.inner
            .lock()
            .expect("radio hub poisoned")
            .silenced
            .insert(addr);
    }

    fn link_up(inner: &HubInner, a: NodeAddress, b: NodeAddress) -> bool {
        let key = if a < b { (a, b) } else { (b, a) };
        !inner.cut_links.contains(&key)
            && !inner.silenced.contains(&a)
            && !inner.silenced.contains(&b)
    }

    fn deliver(&self, from: NodeAddress, to: NodeAddress, proto: u8, frame: &[u8]) -> Result<()> {
        let inner = self.inner.lock().expect("radio hub poisoned");
        if !Self::link_up(&inner, from, to) {
            return Err(Error::transport(format!("no ack from {to}")));
        }
        let Some(tx) = inner.endpoints.get(&to) else {
            return Err(Error::transport(format!("no ack from {to}")));
        };
        let rx_frame = RxFrame {
            from,
            rssi: self.rssi,
            arrival: self.clock.now_ms(),
            proto,
            bytes: frame.to_vec(),
        };
        tx.send(rx_frame)
            .map_err(|_| Error::transport(format!("no ack from {to}")))
    }
}

/// One node's endpoint on a `RadioHub`
pub struct HubRadio {
    hub: Arc<RadioHub>,
    local: NodeAddress,
}

impl Radio for HubRadio {
    fn unicast(&self, dest: NodeAddress, proto: u8, frame: &[u8]) -> Result<()> {
        {
            let inner = self.hub.inner.lock().expect("radio hub poisoned");
            if inner.silenced.contains(&self.local) {
                return Err(Error::transport("channel busy"));
            }
        }
        self.hub.deliver(self.local, dest, proto, frame)
    }

    fn broadcast(&self, proto: u8, frame: &[u8]) -> Result<()> {
        let targets: Vec<NodeAddress> = {
            let inner = self.hub.inner.lock().expect("radio hub poisoned");
            if inner.silenced.contains(&self.local) {
                return Err(Error::transport("channel busy"));
            }
            inner
                .endpoints
                .keys()
                .copied()
                .filter(|a| *a != self.local)
                .collect()
        };
        for dest in targets {
            // Broadcast is unacknowledged: unreachable peers are skipped
            let _ = self.hub.deliver(self.local, dest, proto, frame);
        }
        Ok(())
    }

    fn set_power(&self, _power: u8) {
        // The in-process medium has no range model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SystemClock;

    #[tokio::test]
    async fn test_unicast_and_broadcast() {
        let hub = RadioHub::new(Arc::new(SystemClock));
        let a = NodeAddress(1);
        let b = NodeAddress(2);
        let c = NodeAddress(3);
        let (radio_a, _rx_a) = hub.attach(a);
        let (_radio_b, mut rx_b) = hub.attach(b);
        let (_radio_c, mut rx_c) = hub.attach(c);

        radio_a.unicast(b, 0x21, b"hello").unwrap();
        let frame = rx_b.recv().await.unwrap();
        assert_eq!(frame.from, a);
        assert_eq!(frame.proto, 0x21);
        assert_eq!(frame.bytes, b"hello");

        radio_a.broadcast(0x21, b"all").unwrap();
        assert_eq!(rx_b.recv().await.unwrap().bytes, b"all");
        assert_eq!(rx_c.recv().await.unwrap().bytes, b"all");
    }

    #[tokio::test]
    async fn test_cut_link_fails_unicast() {
        let hub = RadioHub::new(Arc::new(SystemClock));
        let a = NodeAddress(1);
        let b = NodeAddress(2);
        let (radio_a, _rx_a) = hub.attach(a);
        let (_radio_b, _rx_b) = hub.attach(b);

        hub.cut_link(a, b);
        assert!(radio_a.unicast(b, 0x21, b"x").is_err());
    }

    #[tokio::test]
    async fn test_silenced_node_sends_nothing() {
        let hub = RadioHub::new(Arc::new(SystemClock));
        let a = NodeAddress(1);
        let b = NodeAddress(2);
        let (radio_a, _rx_a) = hub.attach(a);
        let (_radio_b, mut rx_b) = hub.attach(b);

        hub.silence(a);
        assert!(radio_a.unicast(b, 0x21, b"x").is_err());
        assert!(radio_a.broadcast(0x21, b"y").is_err());
        assert!(rx_b.try_recv().is_err());
    }
}
