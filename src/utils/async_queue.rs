//! A bounded FIFO queue, used as an orchestrator's in-flight transaction
//! queue (`SPEC_FULL.md` §3). Capacity is enforced cooperatively: `push`
//! waits for room rather than erroring, since the engine's capacity phase
//! already limits how many orchestrators compete for attention.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

pub struct AsyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    push_notify: Notify,
}

impl<T> AsyncQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            push_notify: Notify::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes an item, waiting for room if the queue is at capacity.
    pub async fn push(&self, item: T) {
        loop {
            {
                let mut items = self.items.lock().await;
                if items.len() < self.capacity {
                    items.push_back(item);
                    self.push_notify.notify_waiters();
                    return;
                }
            }
            self.push_notify.notified().await;
        }
    }

    /// Removes and returns every item currently queued, leaving the queue
    /// empty. Used by the orchestrator's per-tick pass, which needs to
    /// iterate the whole in-flight set in nonce order.
    pub async fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().await;
        let drained = items.drain(..).collect();
        self.push_notify.notify_waiters();
        drained
    }

    /// Replaces the queued contents wholesale, used after a per-tick pass
    /// to put back transactions that are still in-flight.
    pub async fn replace(&self, items: Vec<T>) {
        let mut guard = self.items.lock().await;
        *guard = items.into();
        self.push_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_and_drain_preserve_order() {
        let queue = AsyncQueue::new(4);
        queue.push(1).await;
        queue.push(2).await;
        queue.push(3).await;

        assert_eq!(queue.len().await, 3);
        assert_eq!(queue.drain().await, vec![1, 2, 3]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn push_waits_for_room_at_capacity() {
        let queue = std::sync::Arc::new(AsyncQueue::new(1));
        queue.push(1).await;

        let waiter = queue.clone();
        let handle = tokio::spawn(async move {
            waiter.push(2).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        queue.drain().await;
        handle.await.unwrap();
        assert_eq!(queue.len().await, 1);
    }
}
