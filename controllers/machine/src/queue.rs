//! Work queues
//!
//! Named, deduplicating, rate-limited queues of entity keys, one per record
//! kind. A key handed out by `get` is leased: it is not re-delivered to
//! another worker until `done` releases it, and an `add` arriving while the
//! lease is held re-enqueues the key afterwards instead of running it
//! concurrently. This gives per-key at-most-one-in-flight without any
//! locking in the reconcilers themselves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Base delay of the per-key exponential back-off.
const BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Back-off ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// A deduplicating, rate-limited work queue of string keys.
pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    order: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    redo: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key. Duplicates collapse; keys currently leased are marked
    /// for re-delivery once their lease is released.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.processing.contains(key) {
            state.redo.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.order.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after an exponential back-off keyed on its consecutive
    /// failure count (5ms, 10ms, ... capped at 10s).
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff_for(*failures)
        };
        debug!(queue = self.name, key, ?delay, "requeue with back-off");

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Clear the failure history of a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// Pop the next key, waiting until one is available. Returns `None`
    /// once the queue has been shut down and drained of waiters.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the lease on a key. If the key was re-added while leased, it
    /// goes back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.redo.remove(key) && !state.shutdown && state.queued.insert(key.to_string()) {
            state.order.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Stop the queue. Pending keys are dropped and blocked `get` calls
    /// return the termination sentinel.
    pub fn shut_down(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.order.clear();
        state.queued.clear();
        self.notify.notify_waiters();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }
}

fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp.min(21));
    delay.min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new("test");
        queue.add("m1");
        queue.add("m1");
        queue.add("m2");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("m1"));
        assert_eq!(queue.get().await.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn leased_key_is_not_redelivered_until_done() {
        let queue = WorkQueue::new("test");
        queue.add("m1");
        let key = queue.get().await.unwrap();

        // An add during processing must not make the key available now.
        queue.add("m1");
        assert_eq!(queue.len(), 0);

        // It reappears once the lease is released.
        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn done_without_pending_add_does_not_requeue() {
        let queue = WorkQueue::new("test");
        queue.add("m1");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_returns_sentinel() {
        let queue = WorkQueue::new("test");
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        // Give the waiter a chance to block.
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("late");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_are_delayed() {
        let queue = WorkQueue::new("test");
        queue.add_rate_limited("m1");
        assert_eq!(queue.len(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.get().await.as_deref(), Some("m1"));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_for(1), Duration::from_millis(5));
        assert_eq!(backoff_for(2), Duration::from_millis(10));
        assert_eq!(backoff_for(4), Duration::from_millis(40));
        // 5ms * 2^11 > 10s ceiling
        assert_eq!(backoff_for(12), Duration::from_secs(10));
        assert_eq!(backoff_for(31), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn forget_resets_the_backoff_history() {
        let queue = WorkQueue::new("test");
        {
            let mut state = queue.state.lock().unwrap();
            state.failures.insert("m1".to_string(), 9);
        }
        queue.forget("m1");
        assert!(queue.state.lock().unwrap().failures.get("m1").is_none());
    }
}
