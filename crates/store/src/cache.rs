//! Local store: last-known-good object per key, owned by the event processor,
//! with a swap-on-publish snapshot for everybody else.

use std::sync::Arc;

use arc_swap::ArcSwap;
use podwatch_core::{PodObject, ResourceKey, ResourceVersion};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::trace;

/// Result of [`LocalStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// Key was absent.
    Inserted,
    /// Key was present; carries the replaced object.
    Replaced(PodObject),
    /// Same version and content as stored; nothing changed.
    Unchanged,
    /// Incoming version is older than the stored one; rejected.
    Stale { stored: ResourceVersion },
}

/// Immutable view published by the store.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    items: Arc<FxHashMap<ResourceKey, PodObject>>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn get(&self, key: &ResourceKey) -> Option<&PodObject> { self.items.get(key) }

    /// Objects ordered by key.
    pub fn items(&self) -> Vec<&PodObject> {
        let mut v: Vec<&PodObject> = self.items.values().collect();
        v.sort_by(|a, b| a.key.cmp(&b.key));
        v
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct StoreReader {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StoreReader {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn get(&self, key: &ResourceKey) -> Option<PodObject> { self.snap.load().get(key).cloned() }
    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    /// Full enumeration of the published state, ordered by key.
    pub fn snapshot(&self) -> Vec<(ResourceKey, PodObject)> {
        self.current().items().into_iter().map(|o| (o.key.clone(), o.clone())).collect()
    }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl std::fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreReader").field("epoch", &*self.epoch_rx.borrow()).finish()
    }
}

pub struct LocalStore {
    items: FxHashMap<ResourceKey, PodObject>,
    epoch: u64,
    dirty: bool,
    published: Arc<ArcSwap<CacheSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
}

impl LocalStore {
    pub fn new() -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self {
            items: FxHashMap::default(),
            epoch: 0,
            dirty: false,
            published: Arc::new(ArcSwap::from_pointee(CacheSnapshot::default())),
            epoch_tx,
            epoch_rx,
        }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn get(&self, key: &ResourceKey) -> Option<&PodObject> { self.items.get(key) }

    /// Store `obj` unless an equal-or-newer state is already held.
    pub fn upsert(&mut self, obj: PodObject) -> Upsert {
        match self.items.get(&obj.key) {
            Some(cur) if obj.version < cur.version => Upsert::Stale { stored: cur.version },
            Some(cur) if obj.version == cur.version && obj.same_content(cur) => Upsert::Unchanged,
            Some(_) => {
                self.dirty = true;
                let key = obj.key.clone();
                match self.items.insert(key, obj) {
                    Some(old) => Upsert::Replaced(old),
                    None => Upsert::Inserted,
                }
            }
            None => {
                self.dirty = true;
                self.items.insert(obj.key.clone(), obj);
                Upsert::Inserted
            }
        }
    }

    /// Remove and return the last stored object, if any.
    pub fn delete(&mut self, key: &ResourceKey) -> Option<PodObject> {
        let old = self.items.remove(key);
        if old.is_some() {
            self.dirty = true;
        }
        old
    }

    /// Swap in a fresh snapshot for readers if anything changed since the last publish.
    pub fn publish(&mut self) -> u64 {
        if !self.dirty && self.epoch > 0 {
            return self.epoch;
        }
        self.epoch = self.epoch.saturating_add(1);
        self.dirty = false;
        let next = CacheSnapshot { epoch: self.epoch, items: Arc::new(self.items.clone()) };
        self.published.store(Arc::new(next));
        let _ = self.epoch_tx.send(self.epoch);
        metrics::gauge!("store_objects", self.items.len() as f64);
        trace!(epoch = self.epoch, objects = self.items.len(), "store snapshot published");
        self.epoch
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader { snap: Arc::clone(&self.published), epoch_rx: self.epoch_rx.clone() }
    }
}

impl Default for LocalStore {
    fn default() -> Self { Self::new() }
}
