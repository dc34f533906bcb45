//! A rate limited work queue with per key exponential backoff.
//!
//! Keys queued more than once before a worker picks them up collapse into a
//! single entry, and a key re-added while a worker holds it is parked until
//! that worker calls [`WorkQueue::done`]. Failed keys come back through
//! [`WorkQueue::requeue_rate_limited`] with a growing delay until the owner
//! calls [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    /// Add a key to the queue. Keys already waiting are not duplicated, keys
    /// currently being processed are parked until their worker is done.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Mark a key as processed, re-queueing it when it went dirty in between.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.processing.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear the failure history of a key so its next retry starts fresh.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.failures.remove(key);
    }

    /// Re-queue a failed key after its per key backoff delay.
    pub fn requeue_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff(*failures)
        };
        tracing::debug!(queue = self.name, key, ?delay, "requeueing after backoff");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    #[cfg(test)]
    fn failures(&self, key: &str) -> u32 {
        let state = self.state.lock().expect("queue lock poisoned");
        state.failures.get(key).copied().unwrap_or(0)
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(63);
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(exp))
        .map(|delay| delay.min(MAX_DELAY))
        .unwrap_or(MAX_DELAY)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn adds_are_deduplicated() {
        let queue = WorkQueue::new("test");
        let cancel = CancellationToken::new();
        queue.add("ns1/a");
        queue.add("ns1/a");
        queue.add("ns1/b");

        assert_eq!(queue.next(&cancel).await.as_deref(), Some("ns1/a"));
        assert_eq!(queue.next(&cancel).await.as_deref(), Some("ns1/b"));
        queue.done("ns1/a");
        queue.done("ns1/b");

        cancel.cancel();
        assert_eq!(queue.next(&cancel).await, None);
    }

    #[tokio::test]
    async fn keys_added_while_processing_come_back() {
        let queue = WorkQueue::new("test");
        let cancel = CancellationToken::new();
        queue.add("ns1/a");

        let key = queue.next(&cancel).await.unwrap();
        // Re-added mid-processing: parked, not queued.
        queue.add("ns1/a");
        cancel.cancel();
        assert_eq!(queue.next(&cancel).await, None);

        let cancel = CancellationToken::new();
        queue.done(&key);
        assert_eq!(queue.next(&cancel).await.as_deref(), Some("ns1/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_backs_off_and_forget_resets() {
        let queue = WorkQueue::new("test");
        let cancel = CancellationToken::new();

        queue.requeue_rate_limited("ns1/a");
        assert_eq!(queue.failures("ns1/a"), 1);
        // Paused clock auto-advances past the backoff sleep.
        assert_eq!(queue.next(&cancel).await.as_deref(), Some("ns1/a"));
        queue.done("ns1/a");

        queue.requeue_rate_limited("ns1/a");
        assert_eq!(queue.failures("ns1/a"), 2);
        assert_eq!(queue.next(&cancel).await.as_deref(), Some("ns1/a"));
        queue.done("ns1/a");

        queue.forget("ns1/a");
        assert_eq!(queue.failures("ns1/a"), 0);
    }

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(2), Duration::from_millis(10));
        assert_eq!(backoff(3), Duration::from_millis(20));
        assert_eq!(backoff(64), MAX_DELAY);
    }
}
