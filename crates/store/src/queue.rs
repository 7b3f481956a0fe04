//! Key-coalescing FIFO between the reflector and the event processor.

use std::collections::VecDeque;

use parking_lot::Mutex;
use podwatch_core::{Delta, ResourceKey};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Outcome of a blocking [`DeltaQueue::pop`].
#[derive(Debug, Clone)]
pub enum Pop {
    Item(Delta),
    /// Every entry queued by the first `replace` has been popped and the
    /// consumer came back for more. Reported once per queue.
    Synced,
    Closed,
}

struct Inner {
    map: FxHashMap<ResourceKey, Delta>,
    order: VecDeque<ResourceKey>,
    closed: bool,
    populated: bool,
    initial_remaining: usize,
    sync_reported: bool,
    over_warn: bool,
}

impl Inner {
    /// Insert or replace; replacing keeps the key's FIFO position.
    fn push(&mut self, d: Delta) {
        if !self.map.contains_key(&d.key) {
            self.order.push_back(d.key.clone());
        }
        self.map.insert(d.key.clone(), d);
    }

    fn try_pop(&mut self) -> Option<Pop> {
        if self.closed {
            return Some(Pop::Closed);
        }
        if self.populated && self.initial_remaining == 0 && !self.sync_reported {
            self.sync_reported = true;
            return Some(Pop::Synced);
        }
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                self.initial_remaining = self.initial_remaining.saturating_sub(1);
                return Some(Pop::Item(d));
            }
        }
        None
    }
}

/// Coalescing queue keyed by [`ResourceKey`] with FIFO order of first arrival.
///
/// At most one entry is pending per key, so memory is bounded by the number
/// of distinct keys rather than by event volume. Single consumer.
pub struct DeltaQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    warn_len: usize,
}

impl DeltaQueue {
    pub fn new() -> Self { Self::with_warn_len(usize::MAX) }

    /// `warn_len` is a soft limit: crossing it logs a warning, nothing is dropped.
    pub fn with_warn_len(warn_len: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: FxHashMap::default(),
                order: VecDeque::new(),
                closed: false,
                populated: false,
                initial_remaining: 0,
                sync_reported: false,
                over_warn: false,
            }),
            notify: Notify::new(),
            warn_len,
        }
    }

    pub fn len(&self) -> usize { self.inner.lock().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_closed(&self) -> bool { self.inner.lock().closed }

    /// Pending payload for `key`, if any.
    pub fn pending(&self, key: &ResourceKey) -> Option<Delta> { self.inner.lock().map.get(key).cloned() }

    /// True once the first `replace` batch has been handed out in full.
    pub fn has_synced(&self) -> bool {
        let inner = self.inner.lock();
        inner.populated && inner.initial_remaining == 0
    }

    /// Queue a change. Returns false when the queue is closed.
    pub fn push(&self, d: Delta) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.push(d);
            self.observe_depth(&mut inner);
        }
        self.notify.notify_one();
        true
    }

    /// Queue the outcome of a full listing. The first call marks the start of
    /// the initial population; its size is what `Pop::Synced` waits on.
    pub fn replace(&self, deltas: Vec<Delta>) -> usize {
        let n = deltas.len();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return 0;
            }
            for d in deltas {
                inner.push(d);
            }
            if !inner.populated {
                inner.populated = true;
                inner.initial_remaining = inner.order.len();
                debug!(initial = inner.initial_remaining, "initial population queued");
            }
            self.observe_depth(&mut inner);
        }
        self.notify.notify_one();
        n
    }

    /// Queue resync re-deliveries for keys with nothing pending. Returns how many were queued.
    pub fn resync(&self, deltas: Vec<Delta>) -> usize {
        let mut queued = 0;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return 0;
            }
            for d in deltas {
                if !inner.map.contains_key(&d.key) {
                    inner.push(d);
                    queued += 1;
                }
            }
            self.observe_depth(&mut inner);
        }
        if queued > 0 {
            self.notify.notify_one();
        }
        queued
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Pop> {
        let mut inner = self.inner.lock();
        let p = inner.try_pop();
        metrics::gauge!("queue_depth", inner.map.len() as f64);
        p
    }

    /// Wait for the oldest entry, the sync signal, or closure.
    pub async fn pop(&self) -> Pop {
        loop {
            if let Some(p) = self.try_pop() {
                return p;
            }
            // notify_one leaves a permit when nobody waits, so a push landing
            // between try_pop and here is not lost.
            self.notify.notified().await;
        }
    }

    /// Wake the consumer with `Pop::Closed`. Pending entries are not drained.
    pub fn close(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.map.len()
        };
        debug!(pending, "delta queue closed");
        self.notify.notify_one();
    }

    fn observe_depth(&self, inner: &mut Inner) {
        let len = inner.map.len();
        metrics::gauge!("queue_depth", len as f64);
        if len >= self.warn_len && !inner.over_warn {
            inner.over_warn = true;
            warn!(len, warn_len = self.warn_len, "delta queue depth above warning threshold");
        } else if len < self.warn_len {
            inner.over_warn = false;
        }
    }
}

impl Default for DeltaQueue {
    fn default() -> Self { Self::new() }
}
