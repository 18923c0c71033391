//! Bounded async FIFO used to decouple pipeline stages
//!
//! Each queue has exactly one producer task kind and one consumer task
//! kind, so no locking beyond the queue's own is needed. A full queue
//! suspends the producer, which is the backpressure point that keeps a
//! fast capture task from outrunning a slow network sender.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// Maximum number of queued items; `None` means unbounded.
    capacity: Option<usize>,
    pushed: Notify,
    popped: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Some(capacity),
            pushed: Notify::new(),
            popped: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: None,
            pushed: Notify::new(),
            popped: Notify::new(),
        }
    }

    /// Push an item, suspending while the queue is at capacity.
    pub async fn put(&self, item: T) {
        let mut item = Some(item);
        loop {
            // Register for the wakeup before checking, so a pop between
            // the check and the await is not lost.
            let space = self.popped.notified();
            {
                let mut items = self.items.lock().await;
                if self.capacity.map_or(true, |cap| items.len() < cap) {
                    items.push_back(item.take().unwrap());
                    self.pushed.notify_one();
                    return;
                }
            }
            space.await;
        }
    }

    /// Pop the oldest item, suspending while the queue is empty.
    pub async fn get(&self) -> T {
        loop {
            let available = self.pushed.notified();
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    self.popped.notify_one();
                    return item;
                }
            }
            available.await;
        }
    }

    /// Drop all pending items without blocking. Used during stop and
    /// terminate so stale media is never replayed into a later session.
    pub async fn clear(&self) {
        let mut items = self.items.lock().await;
        let drained = items.len();
        items.clear();
        drop(items);
        if drained > 0 {
            self.popped.notify_waiters();
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = BoundedQueue::bounded(5);
        for i in 0..5u32 {
            queue.put(i).await;
        }
        for i in 0..5u32 {
            assert_eq!(queue.get().await, i);
        }
    }

    #[tokio::test]
    async fn put_blocks_at_capacity_until_get() {
        let queue = Arc::new(BoundedQueue::bounded(5));
        for i in 0..5u32 {
            queue.put(i).await;
        }
        assert_eq!(queue.len().await, 5);

        // The sixth put must not complete while the queue is full.
        let q = queue.clone();
        let blocked = tokio::spawn(async move { q.put(5).await });
        let raced = timeout(Duration::from_millis(50), async {
            queue.len().await
        })
        .await
        .unwrap();
        assert_eq!(raced, 5);
        assert!(!blocked.is_finished());

        // One get frees a slot and unblocks the producer.
        assert_eq!(queue.get().await, 0);
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("producer should unblock after a get")
            .unwrap();
        assert_eq!(queue.len().await, 5);
        assert_eq!(queue.get().await, 1);
    }

    #[tokio::test]
    async fn get_blocks_until_put() {
        let queue = Arc::new(BoundedQueue::<u32>::bounded(1));
        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.get().await });
        tokio::task::yield_now().await;
        queue.put(7).await;
        let got = timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should unblock after a put")
            .unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn clear_drains_pending_items() {
        let queue = BoundedQueue::unbounded();
        for i in 0..10u32 {
            queue.put(i).await;
        }
        queue.clear().await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn clear_unblocks_full_producers() {
        let queue = Arc::new(BoundedQueue::bounded(2));
        queue.put(0u32).await;
        queue.put(1u32).await;

        let q = queue.clone();
        let blocked = tokio::spawn(async move { q.put(2).await });
        tokio::task::yield_now().await;

        queue.clear().await;
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("producer should unblock after clear")
            .unwrap();
        assert_eq!(queue.get().await, 2);
    }
}
