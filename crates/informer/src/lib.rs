//! Podwatch informer: list/watch reflector, coalescing queue consumer and the
//! cache-sync barrier, wired together behind a small control surface.
//!
//! ```text
//! SourceClient → Reflector → DeltaQueue → Processor → LocalStore + Handler
//! ```
//!
//! The reflector and the processor run as two tasks that only share the queue;
//! an optional resync task re-queues the published cache on a timer. All of
//! them observe one cancellation token; `stop()` means "stop accepting work",
//! pending queue entries are not flushed.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use podwatch_core::{ResourceEventHandler, SourceClient, SourceError};
use podwatch_store::{DeltaQueue, LocalStore, StoreReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod backoff;
pub mod barrier;
pub mod config;
mod error;
pub mod processor;
pub mod reflector;
pub mod resync;

pub use barrier::{SyncBarrier, SyncSignal};
pub use config::{BackoffConfig, InformerConfig};
pub use error::{HandlerError, InformerError};
pub use processor::Processor;
pub use reflector::{Phase, Reflector, ResyncReason};
pub use resync::Resync;

/// Parts consumed by `start`.
struct Pending<S> {
    reflector: Reflector<S>,
    processor: Processor,
    resync: Option<Resync>,
}

struct Running {
    cancel: CancellationToken,
    reflector: JoinHandle<Result<(), SourceError>>,
    processor: JoinHandle<()>,
    resync: Option<JoinHandle<()>>,
}

/// Watch/cache engine for one source.
pub struct Informer<S> {
    queue: Arc<DeltaQueue>,
    reader: StoreReader,
    barrier: SyncBarrier,
    phase: watch::Receiver<Phase>,
    pending: Option<Pending<S>>,
    running: Option<Running>,
}

impl<S: SourceClient> Informer<S> {
    pub fn new(source: S, handler: Arc<dyn ResourceEventHandler>, config: InformerConfig) -> Self {
        let queue = Arc::new(DeltaQueue::with_warn_len(config.queue_warn_len));
        let store = LocalStore::new();
        let reader = store.reader();
        let (signal, barrier) = SyncBarrier::new();
        let (phase_tx, phase) = watch::channel(Phase::Idle);
        let resync = config.resync_period.map(|period| Resync::new(period, reader.clone(), Arc::clone(&queue)));
        let reflector = Reflector::new(Arc::new(source), Arc::clone(&queue), config, phase_tx);
        let processor = Processor::new(Arc::clone(&queue), store, handler, signal);
        Self { queue, reader, barrier, phase, pending: Some(Pending { reflector, processor, resync }), running: None }
    }

    /// Spawn the reflector and processor tasks. They stop when `cancel` (or
    /// `stop()`) fires, or when the source fails fatally. An engine stopped
    /// before it was started cannot be started.
    pub fn start(&mut self, cancel: &CancellationToken) -> Result<(), InformerError> {
        if self.pending.is_some() && self.queue.is_closed() {
            return Err(InformerError::Stopped);
        }
        let Pending { reflector, processor, resync } = self.pending.take().ok_or(InformerError::AlreadyStarted)?;
        let token = cancel.child_token();

        let reflector = tokio::spawn({
            let token = token.clone();
            let queue = Arc::clone(&self.queue);
            async move {
                let res = reflector.run(token.clone()).await;
                if res.is_err() {
                    // Fatal source failure: take the whole engine down.
                    token.cancel();
                    queue.close();
                }
                res
            }
        });
        let processor = tokio::spawn(processor.run(token.clone()));
        let resync = resync.map(|r| tokio::spawn(r.run(token.clone())));
        info!(resync = resync.is_some(), "informer started");
        self.running = Some(Running { cancel: token, reflector, processor, resync });
        Ok(())
    }

    /// Block until the initial listing is applied and dispatched, or `deadline` elapses.
    pub async fn wait_for_cache_sync(&self, deadline: Duration) -> bool { self.barrier.wait(deadline).await }

    pub fn has_synced(&self) -> bool { self.barrier.is_ready() }

    /// Synchronized read access to the cache.
    pub fn store(&self) -> StoreReader { self.reader.clone() }

    pub fn phase(&self) -> Phase { *self.phase.borrow() }

    /// Resolves once the engine has been told to stop, either by `stop()`, by the
    /// token passed to `start`, or by a fatal source failure. Never resolves before `start`.
    pub async fn stopped(&self) {
        match &self.running {
            Some(r) => r.cancel.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Idempotent. Tasks finish their current step and exit.
    pub fn stop(&self) {
        if let Some(r) = &self.running {
            if !r.cancel.is_cancelled() {
                info!("informer stopping");
            }
            r.cancel.cancel();
        }
        self.queue.close();
    }

    /// Wait for both tasks. `Err` means the engine stopped on an unrecoverable
    /// source failure (or a task died), as opposed to a requested stop.
    pub async fn join(mut self) -> Result<(), InformerError> {
        let Some(Running { reflector, processor, resync, .. }) = self.running.take() else {
            return Ok(());
        };
        let reflected = reflector.await.map_err(|e| InformerError::TaskFailed(e.to_string()))?;
        processor.await.map_err(|e| InformerError::TaskFailed(e.to_string()))?;
        if let Some(resync) = resync {
            resync.await.map_err(|e| InformerError::TaskFailed(e.to_string()))?;
        }
        reflected.map_err(InformerError::from)
    }
}

impl<S> Drop for Informer<S> {
    fn drop(&mut self) {
        if let Some(r) = &self.running {
            r.cancel.cancel();
        }
        self.queue.close();
    }
}
