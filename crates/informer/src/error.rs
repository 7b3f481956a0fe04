use podwatch_core::{ResourceKey, SourceError};

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("informer already started")]
    AlreadyStarted,
    /// `stop()` ran before `start`; the queue is closed for good.
    #[error("informer stopped before start")]
    Stopped,
    /// Unrecoverable source failure; the engine stopped itself.
    #[error("source failed: {0}")]
    Source(#[from] SourceError),
    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

/// A handler callback panicked. Logged by the processor, never propagated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{callback} handler for {key} panicked: {message}")]
pub struct HandlerError {
    pub callback: &'static str,
    pub key: ResourceKey,
    pub message: String,
}
