//! Event processor: the single consumer of the delta queue. Applies each delta
//! to the local store, then dispatches the matching handler callback.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use podwatch_core::{Delta, DeltaKind, DeletedObject, ResourceEventHandler, ResourceKey};
use podwatch_store::{DeltaQueue, LocalStore, Pop, Upsert};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::barrier::SyncSignal;
use crate::error::HandlerError;

pub struct Processor {
    queue: Arc<DeltaQueue>,
    store: LocalStore,
    handler: Arc<dyn ResourceEventHandler>,
    synced: SyncSignal,
}

impl Processor {
    pub fn new(queue: Arc<DeltaQueue>, store: LocalStore, handler: Arc<dyn ResourceEventHandler>, synced: SyncSignal) -> Self {
        Self { queue, store, handler, synced }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let queue = Arc::clone(&self.queue);
        loop {
            let popped = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                p = queue.pop() => p,
            };
            match popped {
                Pop::Item(d) => {
                    self.process(d);
                    if queue.is_empty() {
                        self.store.publish();
                    }
                }
                Pop::Synced => {
                    // Readers must see the full initial state before anyone is told it is ready.
                    self.store.publish();
                    if self.synced.mark_ready() {
                        info!(objects = self.store.len(), "cache synced");
                    }
                }
                Pop::Closed => break,
            }
        }
        self.store.publish();
        info!(pending = queue.len(), "event processor stopped");
    }

    /// Apply one delta to the store and notify the handler.
    pub fn process(&mut self, d: Delta) {
        let Delta { kind, key, object, version } = d;
        match kind {
            DeltaKind::Upsert => {
                let Some(obj) = object else {
                    warn!(key = %key, "upsert without object; ignoring");
                    return;
                };
                match self.store.upsert(obj.clone()) {
                    Upsert::Inserted => self.dispatch("add", &key, |h| h.on_add(&obj)),
                    Upsert::Replaced(old) => self.dispatch("update", &key, |h| h.on_update(Some(&old), &obj)),
                    Upsert::Unchanged => {
                        metrics::counter!("processor_unchanged_total", 1u64);
                        trace!(key = %key, version = %version, "unchanged; no notification");
                    }
                    Upsert::Stale { stored } => {
                        metrics::counter!("processor_stale_total", 1u64);
                        debug!(key = %key, version = %version, stored = %stored, "stale state dropped");
                    }
                }
            }
            DeltaKind::Sync => match self.store.get(&key).cloned() {
                Some(cur) => self.dispatch("update", &key, |h| h.on_update(Some(&cur), &cur)),
                None => trace!(key = %key, "resync for vanished key skipped"),
            },
            DeltaKind::Deleted => {
                let deleted = match self.store.delete(&key) {
                    Some(last) => DeletedObject::Known(last),
                    None => DeletedObject::Tombstone { key: key.clone(), last_known: object },
                };
                self.dispatch("delete", &key, |h| h.on_delete(&deleted));
            }
            DeltaKind::Tombstone => {
                let last_known = self.store.delete(&key).or(object);
                let deleted = DeletedObject::Tombstone { key: key.clone(), last_known };
                self.dispatch("delete", &key, |h| h.on_delete(&deleted));
            }
        }
    }

    /// Invoke a callback; a panic inside it is logged and swallowed.
    fn dispatch(&self, callback: &'static str, key: &ResourceKey, f: impl FnOnce(&dyn ResourceEventHandler)) {
        let handler = self.handler.as_ref();
        match catch_unwind(AssertUnwindSafe(|| f(handler))) {
            Ok(()) => {
                metrics::counter!("processor_events_total", 1u64, "kind" => callback);
            }
            Err(payload) => {
                metrics::counter!("handler_panics_total", 1u64, "kind" => callback);
                let err = HandlerError { callback, key: key.clone(), message: panic_message(payload.as_ref()) };
                error!(error = %err, "handler failed; continuing");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
