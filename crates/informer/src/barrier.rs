//! One-shot "cache synced" flag: a single writer, many waiters.

use std::time::Duration;

use tokio::sync::watch;

/// Writer side, held by the event processor.
#[derive(Debug)]
pub struct SyncSignal {
    tx: watch::Sender<bool>,
}

impl SyncSignal {
    /// Flip to ready. Returns true only for the call that did the flip.
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }
}

/// Reader side; cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncBarrier {
    rx: watch::Receiver<bool>,
}

impl SyncBarrier {
    pub fn new() -> (SyncSignal, SyncBarrier) {
        let (tx, rx) = watch::channel(false);
        (SyncSignal { tx }, SyncBarrier { rx })
    }

    pub fn is_ready(&self) -> bool { *self.rx.borrow() }

    /// Wait until ready or `deadline` elapses. Also returns false if the writer
    /// went away without ever flipping (engine stopped before syncing).
    pub async fn wait(&self, deadline: Duration) -> bool {
        let mut rx = self.rx.clone();
        // The `Ref` returned by `wait_for` borrows `rx`; drop it before `rx` goes.
        let ready = matches!(tokio::time::timeout(deadline, rx.wait_for(|ready| *ready)).await, Ok(Ok(_)));
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flips_exactly_once() {
        let (signal, barrier) = SyncBarrier::new();
        assert!(!barrier.is_ready());
        assert!(signal.mark_ready());
        assert!(!signal.mark_ready());
        assert!(barrier.is_ready());
        assert!(barrier.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn times_out_when_never_ready() {
        let (_signal, barrier) = SyncBarrier::new();
        assert!(!barrier.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn waiter_released_when_flipped_later() {
        let (signal, barrier) = SyncBarrier::new();
        let waiter = tokio::spawn({
            let b = barrier.clone();
            async move { b.wait(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(signal.mark_ready());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn dropped_writer_releases_waiters() {
        let (signal, barrier) = SyncBarrier::new();
        let waiter = tokio::spawn({
            let b = barrier.clone();
            async move { b.wait(Duration::from_secs(5)).await }
        });
        drop(signal);
        assert!(!waiter.await.unwrap());
    }
}
