//! Multi-producer work queue used for every cross-thread hand-off.
//!
//! Any thread may push. The owning consumer drains everything at once; there
//! is no blocking pop, consumers poll or sleep between drains. Push order is
//! preserved in the drained batch.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A thread-safe queue with one lock per instance.
#[derive(Debug)]
pub struct MtQueue<T> {
    items: Mutex<Vec<T>>,
    /// Lock-free size hint so idle consumers can poll without the lock.
    len: AtomicUsize,
}

impl<T> MtQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Append an item.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        items.push(item);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Append a batch of items, keeping their order.
    pub fn push_all(&self, batch: impl IntoIterator<Item = T>) {
        let mut items = self.items.lock();
        items.extend(batch);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Remove and return every queued item in push order.
    pub fn drain_all(&self) -> Vec<T> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut items = self.items.lock();
        self.len.store(0, Ordering::Release);
        std::mem::take(&mut *items)
    }

    /// Number of queued items. May be stale by the time it is read.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MtQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
