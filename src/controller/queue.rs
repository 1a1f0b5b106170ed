//! Rate-limited work queue
//!
//! Semantics follow the classic controller work queue:
//! - a key queued several times before it is picked up is processed once
//! - a key is never handed to two workers at the same time; re-adding a key
//!   that is being processed parks it until [`WorkQueue::done`]
//! - failed keys can be re-added with a per-key exponential delay
//! - after [`WorkQueue::shut_down`] no new keys are accepted and `get`
//!   returns `None` once the remaining keys are drained

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::trace;

/// Per-key exponential delay: `base * 2^failures`, capped at `max`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExponentialRateLimiter {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialRateLimiter {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl ExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay for a key that already failed `failures` times
    pub fn when(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: ExponentialRateLimiter,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(limiter: ExponentialRateLimiter) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    /// Queue `key` for processing
    pub async fn add(&self, key: K) {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(?key, "key in flight, deferring until done");
            return;
        }
        state.queue.push_back(key);
        self.shared.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed
    pub async fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key).await;
        }
        if self.is_shutting_down().await {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Queue `key` after a delay that grows with each call until `forget`
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.shared.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.shared.limiter.when(*failures);
            *failures += 1;
            delay
        };
        trace!(?key, ?delay, "rate limited requeue");
        self.add_after(key, delay).await;
    }

    /// Wait for the next key. Returns `None` once shut down and drained.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed; a re-add that arrived meanwhile is queued now
    pub async fn done(&self, key: &K) {
        let mut state = self.shared.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.shared.notify.notify_one();
        }
    }

    /// Reset the failure count of `key`
    pub async fn forget(&self, key: &K) {
        self.shared.state.lock().await.failures.remove(key);
    }

    /// How many rate-limited requeues `key` has had since the last `forget`
    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.shared
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of keys waiting to be picked up
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop accepting keys and release idle workers
    pub async fn shut_down(&self) {
        self.shared.state.lock().await.shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().await.shutting_down
    }
}
