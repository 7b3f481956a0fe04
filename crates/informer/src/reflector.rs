//! Reflector: drives list→watch against the source and feeds the delta queue.
//!
//! State machine: `Idle → Listing → Watching → (Disconnected | Stale) → …`.
//! A clean close from the peer re-watches from the cursor; transport errors back
//! off and resume from the cursor; an expired cursor backs off in `Stale` and then
//! forces a full relist, which also synthesizes tombstones for keys that vanished
//! in between.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use podwatch_core::{
    Delta, Listing, PodObject, ResourceKey, ResourceVersion, SourceClient, SourceError, SourceEvent, WatchStream,
};
use podwatch_store::DeltaQueue;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::InformerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Listing { reason: ResyncReason },
    Watching,
    Disconnected,
    /// Cursor expired; a full relist is pending.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    Initial,
    /// Transient list failure or source-side relist request.
    Retry,
    VersionTooOld,
}

impl ResyncReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResyncReason::Initial => "initial",
            ResyncReason::Retry => "retry",
            ResyncReason::VersionTooOld => "version_too_old",
        }
    }
}

enum WatchEnd {
    /// Peer closed the stream; `delivered` counts events seen on it.
    Closed { delivered: usize },
    Disconnected(SourceError),
    TooOld(SourceError),
    Fatal(SourceError),
    Cancelled,
}

pub struct Reflector<S> {
    source: Arc<S>,
    queue: Arc<DeltaQueue>,
    config: InformerConfig,
    /// Last live object forwarded per key: the dedup baseline and the tombstone
    /// source. Deleted keys leave, so it holds live keys only.
    ledger: FxHashMap<ResourceKey, PodObject>,
    cursor: Option<ResourceVersion>,
    backoff: Backoff,
    phase: watch::Sender<Phase>,
}

impl<S: SourceClient> Reflector<S> {
    pub fn new(
        source: Arc<S>,
        queue: Arc<DeltaQueue>,
        config: InformerConfig,
        phase: watch::Sender<Phase>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self { source, queue, config, ledger: FxHashMap::default(), cursor: None, backoff, phase }
    }

    fn set_phase(&self, p: Phase) {
        self.phase.send_if_modified(|cur| {
            if *cur == p {
                return false;
            }
            trace!(from = ?*cur, to = ?p, "reflector phase");
            *cur = p;
            true
        });
    }

    /// Run until cancelled. Returns `Err` only for engine-fatal source failures.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SourceError> {
        let mut reason = ResyncReason::Initial;
        info!(backoff = ?self.config.backoff, "reflector started");

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let cursor = match self.cursor {
                Some(c) => c,
                None => {
                    self.set_phase(Phase::Listing { reason });
                    let t0 = Instant::now();
                    let listed = tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        r = self.source.list() => r,
                    };
                    metrics::histogram!("reflector_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    match listed {
                        Ok(listing) => {
                            self.apply_listing(listing, reason);
                            self.backoff.reset();
                            reason = ResyncReason::Retry;
                            continue;
                        }
                        Err(e) if e.is_fatal() => break Err(e),
                        Err(e) => {
                            warn!(error = %e, "list failed");
                            if e.is_too_old() {
                                reason = ResyncReason::VersionTooOld;
                            }
                            self.set_phase(Phase::Disconnected);
                            if !self.wait_backoff(&cancel).await {
                                break Ok(());
                            }
                            continue;
                        }
                    }
                }
            };

            self.set_phase(Phase::Watching);
            let started = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                r = self.source.watch(cursor) => r,
            };
            let end = match started {
                Ok(stream) => {
                    debug!(cursor = %cursor, "watch established");
                    self.consume(stream, &cancel).await
                }
                Err(e) if e.is_fatal() => WatchEnd::Fatal(e),
                Err(e) if e.is_too_old() => WatchEnd::TooOld(e),
                Err(e) => WatchEnd::Disconnected(e),
            };
            metrics::counter!("reflector_watch_restarts_total", 1u64);

            match end {
                WatchEnd::Cancelled => break Ok(()),
                WatchEnd::Fatal(e) => break Err(e),
                WatchEnd::TooOld(e) => {
                    info!(error = %e, cursor = ?self.cursor, "watch cursor expired; relisting");
                    self.set_phase(Phase::Stale);
                    self.cursor = None;
                    reason = ResyncReason::VersionTooOld;
                    if !self.wait_backoff(&cancel).await {
                        break Ok(());
                    }
                }
                WatchEnd::Closed { delivered } if delivered > 0 => {
                    debug!(delivered, cursor = ?self.cursor, "watch closed by peer; resuming");
                }
                WatchEnd::Closed { .. } => {
                    debug!(cursor = ?self.cursor, "watch closed without events");
                    self.set_phase(Phase::Disconnected);
                    if !self.wait_backoff(&cancel).await {
                        break Ok(());
                    }
                }
                WatchEnd::Disconnected(e) => {
                    warn!(error = %e, cursor = ?self.cursor, "watch disconnected");
                    self.set_phase(Phase::Disconnected);
                    if !self.wait_backoff(&cancel).await {
                        break Ok(());
                    }
                }
            }
        };

        self.set_phase(Phase::Idle);
        match &outcome {
            Ok(()) => info!("reflector stopped"),
            Err(e) => warn!(error = %e, "reflector stopped on fatal source error"),
        }
        outcome
    }

    async fn consume(&mut self, mut stream: WatchStream, cancel: &CancellationToken) -> WatchEnd {
        let mut delivered = 0usize;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                item = stream.next() => item,
            };
            let ev = match next {
                None => return WatchEnd::Closed { delivered },
                Some(Err(SourceError::Decode(msg))) => {
                    warn!(error = %msg, "skipping undecodable watch item");
                    continue;
                }
                Some(Err(e)) | Some(Ok(SourceEvent::Error(e))) => return classify(e),
                Some(Ok(ev)) => ev,
            };
            if delivered == 0 {
                self.backoff.reset();
            }
            delivered += 1;
            match ev {
                SourceEvent::Added(obj) | SourceEvent::Updated(obj) => self.forward_upsert(obj),
                SourceEvent::Deleted(obj) => self.forward_delete(obj),
                SourceEvent::Bookmark(rv) => {
                    trace!(version = %rv, "bookmark");
                    self.advance(rv);
                }
                SourceEvent::Error(e) => return classify(e),
            }
            trace!(delivered, queued = self.queue.len(), "watch event forwarded");
        }
    }

    fn advance(&mut self, rv: ResourceVersion) {
        self.cursor = Some(self.cursor.map_or(rv, |c| c.max(rv)));
    }

    /// True when `version` was already seen: for a live key, against its last
    /// forwarded version; for any other key, against the cursor, since versions
    /// are global and the watch only moves forward.
    fn is_duplicate(&self, key: &ResourceKey, version: ResourceVersion) -> bool {
        match self.ledger.get(key) {
            Some(last) => version <= last.version,
            None => self.cursor.is_some_and(|c| version <= c),
        }
    }

    fn forward_upsert(&mut self, obj: PodObject) {
        let dup = self.is_duplicate(&obj.key, obj.version);
        self.advance(obj.version);
        if dup {
            metrics::counter!("reflector_duplicates_total", 1u64);
            debug!(key = %obj.key, version = %obj.version, "dropping duplicate upsert");
            return;
        }
        self.ledger.insert(obj.key.clone(), obj.clone());
        self.queue.push(Delta::upsert(obj));
    }

    fn forward_delete(&mut self, obj: PodObject) {
        let dup = self.is_duplicate(&obj.key, obj.version);
        self.advance(obj.version);
        if dup {
            metrics::counter!("reflector_duplicates_total", 1u64);
            debug!(key = %obj.key, version = %obj.version, "dropping duplicate delete");
            return;
        }
        self.ledger.remove(&obj.key);
        self.queue.push(Delta::deleted(obj));
    }

    /// Queue a full listing: an upsert per listed object plus a tombstone for
    /// every key that was live before and is missing now.
    fn apply_listing(&mut self, listing: Listing, reason: ResyncReason) {
        let Listing { items, version } = listing;
        let mut next: FxHashMap<ResourceKey, PodObject> = FxHashMap::default();
        next.reserve(items.len());
        let mut deltas = Vec::with_capacity(items.len());
        for obj in items {
            next.insert(obj.key.clone(), obj.clone());
            deltas.push(Delta::upsert(obj));
        }
        let listed = deltas.len();
        let mut vanished = 0usize;
        for (key, last) in self.ledger.drain() {
            if !next.contains_key(&key) {
                vanished += 1;
                deltas.push(Delta::tombstone(key, Some(last), version));
            }
        }
        self.ledger = next;
        self.cursor = Some(version);
        self.queue.replace(deltas);
        metrics::counter!("reflector_lists_total", 1u64);
        metrics::counter!("reflector_relists_total", 1u64, "reason" => reason.as_str());
        info!(objects = listed, vanished, version = %version, reason = reason.as_str(), "listed");
    }

    async fn wait_backoff(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, attempt = self.backoff.attempts(), "backing off");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn classify(e: SourceError) -> WatchEnd {
    if e.is_fatal() {
        WatchEnd::Fatal(e)
    } else if e.is_too_old() {
        WatchEnd::TooOld(e)
    } else {
        WatchEnd::Disconnected(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podwatch_core::DeltaKind;

    struct NoSource;

    #[async_trait::async_trait]
    impl SourceClient for NoSource {
        async fn list(&self) -> Result<Listing, SourceError> { Err(SourceError::Transient("unused".into())) }
        async fn watch(&self, _since: ResourceVersion) -> Result<WatchStream, SourceError> {
            Err(SourceError::Transient("unused".into()))
        }
    }

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

    fn reflector(initial: Vec<PodObject>, version: u64) -> (Reflector<NoSource>, Arc<DeltaQueue>) {
        let queue = Arc::new(DeltaQueue::new());
        let (phase, _) = watch::channel(Phase::Idle);
        let mut r = Reflector::new(Arc::new(NoSource), Arc::clone(&queue), InformerConfig::default(), phase);
        r.apply_listing(Listing { items: initial, version: ResourceVersion(version) }, ResyncReason::Initial);
        while queue.try_pop().is_some() {}
        (r, queue)
    }

    #[test]
    fn churned_keys_do_not_stay_in_ledger() {
        let (mut r, queue) = reflector(Vec::new(), 1);
        for i in 0..1000u64 {
            let name = format!("job-{}", i);
            r.forward_upsert(pod(&name, 2 + 2 * i));
            r.forward_delete(pod(&name, 3 + 2 * i));
        }
        assert!(r.ledger.is_empty());
        assert_eq!(r.cursor, Some(ResourceVersion(2001)));
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn redelivered_delete_and_stale_readd_are_dropped() {
        let (mut r, queue) = reflector(vec![pod("a", 1)], 1);
        r.forward_delete(pod("a", 5));
        assert_eq!(queue.len(), 1);
        while queue.try_pop().is_some() {}

        r.forward_delete(pod("a", 5));
        r.forward_upsert(pod("a", 4));
        assert!(queue.is_empty());
        assert!(r.ledger.is_empty());

        // recreated under the same name
        r.forward_upsert(pod("a", 6));
        assert_eq!(queue.pending(&ResourceKey::new("default", "a")).map(|d| d.kind), Some(DeltaKind::Upsert));
        assert_eq!(r.ledger.len(), 1);
    }

    #[test]
    fn relist_tombstones_only_live_keys() {
        let (mut r, queue) = reflector(vec![pod("a", 1), pod("b", 2)], 2);
        r.forward_delete(pod("a", 3));
        while queue.try_pop().is_some() {}

        r.apply_listing(Listing { items: Vec::new(), version: ResourceVersion(9) }, ResyncReason::VersionTooOld);
        let tombstones: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .filter_map(|p| match p {
                podwatch_store::Pop::Item(d) if d.kind == DeltaKind::Tombstone => Some(d.key.name),
                _ => None,
            })
            .collect();
        assert_eq!(tombstones, vec!["b".to_string()]);
        assert!(r.ledger.is_empty());
    }
}
