//! Nimbus task queue: coalescing key queue with rate-limited requeue and
//! a tokio worker pool.
//!
//! Semantics follow the usual controller work queue: a key sitting in the
//! queue is `dirty`; a key handed to a worker is `processing`; re-adds of
//! a processing key coalesce and replay once the worker calls `done`.
//! At most one worker syncs a given key at a time.

#![forbid(unsafe_code)]

mod limiter;
mod worker;

pub use limiter::{default_rate_limiter, BucketLimiter, ItemExponentialBackoff, MaxOfRateLimiter, RateLimiter};
pub use worker::{run_workers, SyncFn, WorkerPool, UPDATE_MAX_RETRIES};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::error;

use nimbus_core::keys::object_key;

struct Inner {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    pub fn new(name: &'static str, limiter: Box<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        })
    }

    pub fn with_default_limiter(name: &'static str) -> Arc<Self> {
        Self::new(name, Box::new(default_rate_limiter()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add a key. Dirty keys coalesce; keys being processed are replayed
    /// after `done`.
    pub fn add(&self, key: &str) {
        let mut g = self.inner.lock().expect("queue lock poisoned");
        if g.shutting_down || g.dirty.contains(key) {
            return;
        }
        g.dirty.insert(key.to_string());
        if !g.processing.contains(key) {
            g.queue.push_back(key.to_string());
            gauge!("queue_depth", g.queue.len() as f64, "queue" => self.name);
            drop(g);
            self.notify.notify_one();
        }
    }

    /// Add after a delay. A zero delay adds immediately.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let this = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.add(&key);
        });
    }

    /// Add after whatever delay the rate limiter assigns the key.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.limiter.when(key);
        self.add_after(key, delay);
    }

    /// Derive the `"<namespace>/<name>"` key and add it. Objects without
    /// a name are dropped with a logged error.
    pub fn enqueue(&self, namespace: Option<&str>, name: Option<&str>) {
        match name {
            Some(n) if !n.is_empty() => self.add(&object_key(namespace, n)),
            _ => {
                error!(queue = self.name, "dropping object: no key could be derived");
                counter!("queue_dropped_total", 1u64, "queue" => self.name);
            }
        }
    }

    /// Block until a key is available. Returns `None` once the queue is
    /// shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut g = self.inner.lock().expect("queue lock poisoned");
                if let Some(key) = g.queue.pop_front() {
                    g.dirty.remove(&key);
                    g.processing.insert(key.clone());
                    gauge!("queue_depth", g.queue.len() as f64, "queue" => self.name);
                    let more = !g.queue.is_empty();
                    drop(g);
                    // Hand the wakeup on: notify_one stores a single
                    // permit, so a burst of adds can wake only one worker.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if g.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's sync finished; replays the key if it went dirty again
    /// while processing.
    pub fn done(&self, key: &str) {
        let mut g = self.inner.lock().expect("queue lock poisoned");
        g.processing.remove(key);
        if g.dirty.contains(key) {
            g.queue.push_back(key.to_string());
            gauge!("queue_depth", g.queue.len() as f64, "queue" => self.name);
            drop(g);
            self.notify.notify_one();
        }
    }

    /// Clear the key's rate-limit history after a successful sync.
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.retries(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutting_down(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").shutting_down
    }

    /// Stop accepting adds. Workers drain what is queued and then exit.
    pub fn shutdown(&self) {
        let mut g = self.inner.lock().expect("queue lock poisoned");
        g.shutting_down = true;
        drop(g);
        self.notify.notify_waiters();
    }
}
