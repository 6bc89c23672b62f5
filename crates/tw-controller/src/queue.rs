//! Per-controller work queue with key deduplication.
//!
//! Keys collapse while queued, and a key being processed is never handed to
//! a second worker; a re-add during processing marks it dirty and it is
//! re-enqueued when the worker calls [`WorkQueue::done`]. Handles are cheap
//! clones over shared state, one per worker.

use dashmap::DashSet;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Inner<K> {
    tx: mpsc::UnboundedSender<K>,
    rx: Mutex<mpsc::UnboundedReceiver<K>>,
    queued: DashSet<K>,
    processing: DashSet<K>,
    dirty: DashSet<K>,
}

pub struct WorkQueue<K: Eq + Hash + Clone + Send + Sync + 'static> {
    inner: Arc<Inner<K>>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> WorkQueue<K> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                queued: DashSet::new(),
                processing: DashSet::new(),
                dirty: DashSet::new(),
            }),
        }
    }

    /// Enqueue a key. Duplicates of queued keys are dropped; keys currently
    /// being processed are re-enqueued once their worker finishes.
    pub fn add(&self, key: K) {
        if self.inner.processing.contains(&key) {
            self.inner.dirty.insert(key);
            return;
        }
        if self.inner.queued.insert(key.clone()) {
            // Receiver lives as long as the queue.
            let _ = self.inner.tx.send(key);
        }
    }

    /// Enqueue a key after a delay (requeue-after hint).
    pub fn add_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Pull the next key, marking it as being processed.
    pub async fn next(&self) -> Option<K> {
        let key = loop {
            // Never hold the receiver lock across an await point.
            {
                let mut rx = self.inner.rx.lock();
                match rx.try_recv() {
                    Ok(key) => break key,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        self.inner.queued.remove(&key);
        self.inner.processing.insert(key.clone());
        Some(key)
    }

    /// Mark a key's processing finished; dirty keys go straight back in.
    pub fn done(&self, key: &K) {
        self.inner.processing.remove(key);
        if self.inner.dirty.remove(key).is_some() {
            self.add(key.clone());
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inner.queued.is_empty() && self.inner.processing.is_empty()
    }
}
