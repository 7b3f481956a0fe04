//! Periodic resync: re-queues the cached state on a fixed interval.
//!
//! Runs as its own task so the sweep keeps going while the reflector is
//! listing, backing off, or failing to establish a watch.

use std::sync::Arc;
use std::time::Duration;

use podwatch_core::Delta;
use podwatch_store::{DeltaQueue, StoreReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Resync {
    period: Duration,
    store: StoreReader,
    queue: Arc<DeltaQueue>,
}

impl Resync {
    pub fn new(period: Duration, store: StoreReader, queue: Arc<DeltaQueue>) -> Self { Self { period, store, queue } }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.period, "resync started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep();
                }
            }
        }
        debug!("resync stopped");
    }

    /// Queue a `Sync` delta per cached object; keys with pending changes are skipped.
    pub fn sweep(&self) -> usize {
        let deltas: Vec<Delta> = self.store.snapshot().into_iter().map(|(_, obj)| Delta::sync(obj)).collect();
        let total = deltas.len();
        let queued = self.queue.resync(deltas);
        metrics::counter!("resync_queued_total", queued as u64);
        debug!(total, queued, "periodic resync");
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podwatch_core::{DeltaKind, PodObject, ResourceKey, ResourceVersion};
    use podwatch_store::LocalStore;

    fn pod(name: &str, rv: u64) -> PodObject {
        PodObject {
            key: ResourceKey::new("default", name),
            uid: format!("uid-{}", name),
            version: ResourceVersion(rv),
            ip: String::new(),
            phase: "Running".into(),
            node: None,
        }
    }

    #[test]
    fn sweep_queues_published_objects_not_already_pending() {
        let mut store = LocalStore::new();
        store.upsert(pod("a", 1));
        store.upsert(pod("b", 2));
        store.publish();
        let queue = Arc::new(DeltaQueue::new());
        queue.push(Delta::upsert(pod("b", 3)));

        let resync = Resync::new(Duration::from_secs(1), store.reader(), Arc::clone(&queue));
        assert_eq!(resync.sweep(), 1);
        assert_eq!(queue.pending(&ResourceKey::new("default", "a")).map(|d| d.kind), Some(DeltaKind::Sync));
        assert_eq!(queue.pending(&ResourceKey::new("default", "b")).map(|d| d.kind), Some(DeltaKind::Upsert));
    }
}
