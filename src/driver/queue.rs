//! Hand-off queues between the simulation thread and the I/O workers.
//!
//! - [`TxQueue`]: bounded FIFO of outbound packets, consumed by the transmit worker
//! - [`EventQueue`]: FIFO of [`ModemEvent`]s produced by the workers and
//!   drained only by the simulation thread's periodic tick

use crate::lock;
use crate::sim::Packet;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Depth of the transmit queue when the configuration does not say otherwise.
pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 16;

pub struct TxQueue {
    packets: Mutex<VecDeque<Packet>>,
    available: Condvar,
    capacity: usize,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Appends `packet` unless the queue is full, in which case the packet
    /// is handed back and the queue is left untouched.
    pub fn push(&self, packet: Packet) -> Result<(), Packet> {
        let mut packets = lock(&self.packets);
        if packets.len() >= self.capacity {
            return Err(packet);
        }
        packets.push_back(packet);
        drop(packets);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a packet is available or `keep_waiting` turns false.
    pub fn pop(&self, keep_waiting: impl Fn() -> bool) -> Option<Packet> {
        let mut packets = lock(&self.packets);
        loop {
            if !keep_waiting() {
                return None;
            }
            if let Some(packet) = packets.pop_front() {
                return Some(packet);
            }
            packets = self.available.wait(packets).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Wakes a blocked [`TxQueue::pop`] so it re-checks its condition.
    pub fn wake_all(&self) {
        let _packets = lock(&self.packets);
        self.available.notify_all();
    }

    /// Removes every queued packet.
    pub fn clear(&self) -> Vec<Packet> {
        lock(&self.packets).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.packets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Work the simulation thread has to carry out on behalf of a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ModemEvent {
    /// A payload arrived from the device and must go up the stack.
    Received(Packet),
    /// The device accepted a packet; the MAC layer must be told.
    TxEnded(Packet),
}

#[derive(Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<ModemEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: ModemEvent) {
        lock(&self.events).push_back(event);
    }

    /// Takes every pending event in arrival order.
    pub fn drain(&self) -> Vec<ModemEvent> {
        lock(&self.events).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_overflow_returns_packet() {
        let queue = TxQueue::new(2);
        assert!(queue.push(Packet::outbound(b"a".to_vec(), 1)).is_ok());
        assert!(queue.push(Packet::outbound(b"b".to_vec(), 1)).is_ok());
        let rejected = queue.push(Packet::outbound(b"c".to_vec(), 1)).unwrap_err();
        assert_eq!(rejected.payload, b"c");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let queue = TxQueue::new(4);
        for payload in [b"1", b"2", b"3"] {
            queue.push(Packet::outbound(payload.to_vec(), 0)).unwrap();
        }
        let order: Vec<Vec<u8>> = (0..3).filter_map(|_| queue.pop(|| true)).map(|p| p.payload).collect();
        assert_eq!(order, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_pop_returns_none_when_woken_for_shutdown() {
        let queue = Arc::new(TxQueue::new(1));
        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::spawn(move || queue.pop(|| running.load(Ordering::SeqCst)))
        };
        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        queue.wake_all();
        assert!(worker.join().unwrap().is_none());
    }

    #[test]
    fn test_event_queue_drains_in_order() {
        let events = EventQueue::new();
        events.push(ModemEvent::TxEnded(Packet::outbound(b"x".to_vec(), 2)));
        events.push(ModemEvent::Received(Packet::received(b"y".to_vec(), None)));
        let drained = events.drain();
        assert!(matches!(drained[0], ModemEvent::TxEnded(_)));
        assert!(matches!(drained[1], ModemEvent::Received(_)));
        assert!(events.is_empty());
    }
}
