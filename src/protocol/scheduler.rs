use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::Clock;
use crate::protocol::event::ProtocolEvent;

/// Heap entry ordered by execution timestamp only
///
/// `BinaryHeap` is a max-heap, so the ordering is reversed to pop the
/// earliest timestamp first. Equal timestamps have no secondary ordering.
struct Entry(ProtocolEvent);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.at == other.0.at
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.at.cmp(&self.0.at)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered event queue driving the protocol coordinator
///
/// `add` may be called from any task; `next` is awaited by the single
/// coordinator consumer. An event becomes visible only at or after its
/// execution timestamp. The wait re-checks the heap head on every wakeup,
/// since a later insert may carry an earlier due time, and tolerates
/// spurious wakeups by design.
pub struct ActionScheduler {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl ActionScheduler {
    /// Creates an empty scheduler driven by the given clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        ActionScheduler {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            clock,
        }
    }

    /// Current reading of the scheduler's clock
    pub fn clock_now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Inserts an event and wakes a blocked `next` caller
    pub fn add(&self, event: ProtocolEvent) {
        {
            let mut heap = self.heap.lock().expect("scheduler heap poisoned");
            heap.push(Entry(event));
        }
        self.notify.notify_one();
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.heap.lock().expect("scheduler heap poisoned").len()
    }

    /// Returns true when no events are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until the earliest event is due, then pops and returns it
    pub async fn next(&self) -> ProtocolEvent {
        loop {
            let wait = {
                let mut heap = self.heap.lock().expect("scheduler heap poisoned");
                match heap.peek() {
                    Some(entry) => {
                        let now = self.clock.now_ms();
                        if entry.0.at <= now {
                            return heap.pop().expect("peeked entry vanished").0;
                        }
                        Some(Duration::from_millis(entry.0.at - now))
                    }
                    None => None,
                }
            };

            match wait {
                Some(dur) => {
                    tokio::select! {
                        _ = tokio::time::sleep(dur) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}
