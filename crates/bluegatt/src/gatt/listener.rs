//! Characteristic value listeners
//!
//! Listeners receive server-originated notifications and indications. The
//! registry keeps a copy-on-write list: fan-out iterates a snapshot, so
//! listeners may register or remove listeners (including themselves) from
//! inside a callback.
use super::types::Characteristic;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Receiver of notifications and indications for matching characteristics.
pub trait CharListener: Send + Sync {
    /// Whether this listener wants events of `characteristic`. The default
    /// accepts everything.
    fn matches(&self, _characteristic: &Characteristic) -> bool {
        true
    }

    /// A notification arrived for a matching characteristic.
    fn on_notification(&self, characteristic: &Characteristic, data: &[u8], ts: Instant);

    /// An indication arrived for a matching characteristic. `cfm_sent`
    /// tells whether the session already confirmed it.
    fn on_indication(&self, characteristic: &Characteristic, data: &[u8], ts: Instant, cfm_sent: bool);
}

/// Append-only, duplicate-free listener registry with snapshot iteration.
pub struct ListenerSet {
    list: Mutex<Arc<Vec<Arc<dyn CharListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Arc::new(Vec::new())),
        }
    }

    /// Registers a listener. Returns `false` when the same listener
    /// (by identity) is already registered.
    pub fn add(&self, listener: Arc<dyn CharListener>) -> bool {
        let mut guard = self.list.lock().unwrap();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Removes a listener by identity. Returns `false` when it was not
    /// registered.
    pub fn remove(&self, listener: &Arc<dyn CharListener>) -> bool {
        let mut guard = self.list.lock().unwrap();
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        let removed = next.len() < before;
        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Removes every listener matching `characteristic`. Returns the count.
    pub fn remove_matching(&self, characteristic: &Characteristic) -> usize {
        let mut guard = self.list.lock().unwrap();
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !l.matches(characteristic))
            .cloned()
            .collect();
        let removed = before - next.len();
        if removed > 0 {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Removes all listeners. Returns the count.
    pub fn clear(&self) -> usize {
        let mut guard = self.list.lock().unwrap();
        let count = guard.len();
        *guard = Arc::new(Vec::new());
        count
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An immutable snapshot for fan-out.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn CharListener>>> {
        self.list.lock().unwrap().clone()
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}
