//! Bounded drop-oldest FIFO used for both session buffers.
//!
//! A full buffer never makes the producer wait: the oldest entry is evicted
//! to admit the newest. Audio is only useful while it is fresh, so recency
//! wins over completeness. The consumer side waits on a [`Notify`] instead
//! of polling.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Default capacity of the client → bridge audio buffer.
pub const INGRESS_CAPACITY: usize = 10;
/// Default capacity of the session → client outbound buffer.
pub const EGRESS_CAPACITY: usize = 5;

/// Raw audio chunks, as received from the client.
pub type AudioBuffer = BoundedBuffer<Bytes>;

pub struct BoundedBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BoundedBuffer<T> {
    /// Creates an empty buffer. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Appends `item`, evicting and returning the oldest entry if the buffer
    /// was already full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Waits for the next item. Cancel-safe: dropping the future never loses
    /// an item, since removal happens synchronously right before returning.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Waits until at least one item is buffered, without removing it.
    pub async fn ready(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discards every buffered item and returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }
}

impl<T: Clone> BoundedBuffer<T> {
    /// Copies the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }
}
