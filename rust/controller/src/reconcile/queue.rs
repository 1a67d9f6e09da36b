//! A deduplicating FIFO keyed by `namespace/name`, modelled on
//! client-go's workqueue: a `dirty` set, a `processing` set and an
//! ordered queue of dirty-and-not-processing keys. Enqueueing a key
//! that is already dirty is a no-op; enqueueing a key that is
//! currently being processed marks it dirty without making it
//! dequeueable a second time, so a second worker can never dequeue a
//! key that a first worker is still inside `sync()` for. The worker
//! calls `done` once its `sync()` call returns, at which point a key
//! marked dirty in the meantime is moved back onto the queue.
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::Notify;

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

struct QueueState<K> {
    order: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
}

/// Clone-cheap handle around the shared queue state; `enqueue` is
/// `&self`, so a `DedupQueue` can be shared across watcher tasks without
/// extra wrapping.
pub struct DedupQueue<K> {
    inner: std::sync::Arc<Inner<K>>,
}

impl<K> Clone for DedupQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for DedupQueue<K> {
    fn default() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                state: Mutex::new(QueueState {
                    order: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }
}

impl<K: Eq + Hash + Clone> DedupQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// No-op if `key` is already dirty. If `key` is currently being
    /// processed, marks it dirty but does not queue it a second time —
    /// `done` re-queues it once the in-flight `sync()` returns.
    pub fn enqueue(&self, key: K) {
        let mut state = self.inner.state.lock().expect("queue mutex poisoned");
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.order.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for and removes the next key, moving it into `processing`
    /// and clearing it from `dirty` — a subsequent `enqueue` for the
    /// same key will mark it dirty again but will not queue it twice.
    /// The caller must call [`Self::done`] once its `sync()` for this
    /// key returns, whether it succeeded or failed.
    pub async fn dequeue(&self) -> K {
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue mutex poisoned");
                if let Some(key) = state.order.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    return key;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks `key` no longer in flight. If it was enqueued again while
    /// processing, it re-enters the queue now instead of being lost or
    /// running concurrently with the call that just finished.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().expect("queue mutex poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.order.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("queue mutex poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_enqueue_is_a_no_op() {
        let queue: DedupQueue<String> = DedupQueue::new();
        queue.enqueue("ns/a".to_string());
        queue.enqueue("ns/a".to_string());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await, "ns/a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_across_distinct_keys() {
        let queue: DedupQueue<String> = DedupQueue::new();
        queue.enqueue("ns/a".to_string());
        queue.enqueue("ns/b".to_string());
        assert_eq!(queue.dequeue().await, "ns/a");
        assert_eq!(queue.dequeue().await, "ns/b");
    }

    #[tokio::test]
    async fn dequeue_waits_for_an_enqueue() {
        let queue: DedupQueue<String> = DedupQueue::new();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("ns/later".to_string());
        assert_eq!(waiter.await.unwrap(), "ns/later");
    }

    #[tokio::test]
    async fn a_key_can_be_requeued_once_it_left_the_queue() {
        let queue: DedupQueue<String> = DedupQueue::new();
        queue.enqueue("ns/a".to_string());
        let key = queue.dequeue().await;
        queue.done(&key);
        // Simulates a sync failure: the worker re-enqueues the same key.
        queue.enqueue("ns/a".to_string());
        assert_eq!(queue.len(), 1);
    }

    /// The race the maintainer flagged: a key re-enqueued while a
    /// worker is still inside `sync()` for it must not become
    /// dequeueable until that worker calls `done`, so a second worker
    /// can never run `sync()` for the same key concurrently.
    #[tokio::test]
    async fn reenqueue_while_in_flight_does_not_unblock_a_second_dequeue() {
        let queue: DedupQueue<String> = DedupQueue::new();
        queue.enqueue("ns/a".to_string());
        let key = queue.dequeue().await;
        assert_eq!(key, "ns/a");

        // A config-watch event fires while the first worker is still
        // "inside sync()" for ns/a.
        queue.enqueue("ns/a".to_string());
        assert!(queue.is_empty(), "dirty-while-processing must not requeue yet");

        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished(), "no key is dequeueable while ns/a is still processing");

        // The first worker's sync() returns.
        queue.done(&key);
        assert_eq!(second.await.unwrap(), "ns/a");
    }
}
