//! Bounded blocking FIFO for inbound response PDUs
//!
//! Single producer (the reader loop) and single consumer (the request
//! pipeline) at runtime; the lock makes it safe for the degenerate
//! multi-producer case of test hooks.
use super::pdu::Inbound;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded blocking PDU queue with timed pop.
pub struct PduRing {
    queue: Mutex<VecDeque<Inbound>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl PduRing {
    /// Creates a ring holding at most `capacity` PDUs.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues one PDU, blocking while the ring is full.
    pub fn put_blocking(&self, pdu: Inbound) {
        let mut queue = self.queue.lock().unwrap();
        while queue.len() >= self.capacity {
            queue = self.not_full.wait(queue).unwrap();
        }
        queue.push_back(pdu);
        self.not_empty.notify_one();
    }

    /// Dequeues one PDU, waiting up to `timeout`. `None` on expiry.
    pub fn get_blocking(&self, timeout: Duration) -> Option<Inbound> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(pdu) = queue.pop_front() {
                self.not_full.notify_one();
                return Some(pdu);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .not_empty
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    /// Number of queued PDUs.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all queued PDUs and releases blocked producers.
    pub fn clear(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        self.not_full.notify_all();
    }
}
