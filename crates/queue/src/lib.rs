//! Steward queue: coalescing work queue keyed by resource, with single-flight
//! processing per key and a bounded worker pool.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use steward_core::{ReconcileConfig, ReconcileOutcome};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// FIFO of distinct keys plus in-flight bookkeeping.
///
/// A key is never handed out twice at once: pushes that arrive while it is
/// being processed mark it dirty and it is re-queued when `done` is called.
pub struct Coalescer<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    in_flight: FxHashSet<K>,
    dirty: FxHashSet<K>,
    coalesced: u64,
}

impl<K: Clone + Eq + Hash> Default for Coalescer<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Clone + Eq + Hash> Coalescer<K> {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            queued: FxHashSet::default(),
            in_flight: FxHashSet::default(),
            dirty: FxHashSet::default(),
            coalesced: 0,
        }
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn in_flight(&self) -> usize { self.in_flight.len() }
    /// Pushes absorbed by an already queued or running key.
    pub fn coalesced(&self) -> u64 { self.coalesced }

    pub fn push(&mut self, key: K) {
        if self.in_flight.contains(&key) {
            if !self.dirty.insert(key) { self.coalesced += 1; }
            return;
        }
        if self.queued.insert(key.clone()) {
            self.order.push_back(key);
        } else {
            self.coalesced += 1;
        }
    }

    /// Take the next key and mark it in flight.
    pub fn pop(&mut self) -> Option<K> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Release a key; if it was pushed meanwhile it goes to the back of the queue.
    pub fn done(&mut self, key: &K) {
        self.in_flight.remove(key);
        if self.dirty.remove(key) && self.queued.insert(key.clone()) {
            self.order.push_back(key.clone());
        }
    }
}

/// Shared, cloneable handle over a [`Coalescer`].
pub struct WorkQueue<K> {
    inner: Arc<Mutex<Coalescer<K>>>,
    notify: Arc<Notify>,
    name: &'static str,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), notify: Arc::clone(&self.notify), name: self.name }
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> WorkQueue<K> {
    pub fn new(name: &'static str) -> Self {
        Self { inner: Arc::new(Mutex::new(Coalescer::new())), notify: Arc::new(Notify::new()), name }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Coalescer<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn push(&self, key: K) {
        let depth = {
            let mut q = self.lock();
            q.push(key);
            q.len()
        };
        gauge!("queue_depth", depth as f64, "queue" => self.name);
        self.notify.notify_one();
    }

    /// Push `key` once `after` has elapsed.
    pub fn push_after(&self, key: K, after: std::time::Duration) {
        if after.is_zero() {
            self.push(key);
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            q.push(key);
        });
    }

    pub fn try_pop(&self) -> Option<K> { self.lock().pop() }

    /// Wait for the next key.
    pub async fn pop(&self) -> K {
        loop {
            let notified = self.notify.notified();
            if let Some(k) = self.try_pop() {
                // Another key may be waiting; pass the wake-up along.
                if !self.is_empty() { self.notify.notify_one(); }
                return k;
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &K) {
        let requeued = {
            let mut q = self.lock();
            q.done(key);
            !q.is_empty()
        };
        if requeued { self.notify.notify_one(); }
    }
}

/// Read-mostly reconcile configuration. Workers take a snapshot at the start
/// of each invocation; reloads swap the whole value.
#[derive(Clone)]
pub struct ConfigHandle {
    cur: Arc<ArcSwap<ReconcileConfig>>,
}

impl ConfigHandle {
    pub fn new(cfg: ReconcileConfig) -> Self { Self { cur: Arc::new(ArcSwap::from_pointee(cfg)) } }

    pub fn snapshot(&self) -> Arc<ReconcileConfig> { self.cur.load_full() }

    pub fn store(&self, cfg: ReconcileConfig) {
        info!(?cfg, "reconcile configuration updated");
        self.cur.store(Arc::new(cfg));
    }
}

/// Spawn `workers` tasks draining `queue` through `handler`.
///
/// Each outcome asking for a requeue schedules the key again after
/// `requeue_after`. Returns the join handles so the host can abort them on
/// shutdown.
pub fn spawn_workers<K, F, Fut>(queue: WorkQueue<K>, workers: usize, handler: F) -> Vec<tokio::task::JoinHandle<()>>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
    F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ReconcileOutcome> + Send + 'static,
{
    (0..workers.max(1))
        .map(|id| {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                debug!(worker = id, queue = queue.name, "worker started");
                loop {
                    let key = queue.pop().await;
                    let outcome = handler(key.clone()).await;
                    if let Some(err) = &outcome.error {
                        counter!("reconcile_errors_total", 1u64, "queue" => queue.name);
                        warn!(key = %key, error = %err, requeue_after = ?outcome.requeue_after, "reconcile failed");
                    }
                    queue.done(&key);
                    if outcome.requeue {
                        queue.push_after(key, outcome.requeue_after);
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_pushes_coalesce_in_fifo_order() {
        let mut c = Coalescer::new();
        c.push("a");
        c.push("b");
        c.push("a");
        assert_eq!(c.len(), 2);
        assert_eq!(c.coalesced(), 1);
        assert_eq!(c.pop(), Some("a"));
        assert_eq!(c.pop(), Some("b"));
        assert_eq!(c.pop(), None);
    }

    #[test]
    fn key_in_flight_is_not_handed_out_again() {
        let mut c = Coalescer::new();
        c.push("a");
        assert_eq!(c.pop(), Some("a"));
        c.push("a");
        c.push("a");
        assert_eq!(c.pop(), None);
        c.done(&"a");
        assert_eq!(c.pop(), Some("a"));
        c.done(&"a");
        assert!(c.is_empty());
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn config_snapshot_is_stable_across_store() {
        let handle = ConfigHandle::new(ReconcileConfig::default());
        let before = handle.snapshot();
        handle.store(ReconcileConfig { steady_interval: std::time::Duration::from_secs(60), ..Default::default() });
        assert_eq!(before.steady_interval, std::time::Duration::from_secs(15));
        assert_eq!(handle.snapshot().steady_interval, std::time::Duration::from_secs(60));
    }
}
