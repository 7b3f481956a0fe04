//! Source client capability: full listing plus an incremental watch stream.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{PodObject, ResourceVersion};

/// Failures reported by a source client.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceError {
    /// Network or server hiccup; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The watch cursor has been compacted away; a full relist is required.
    #[error("resource version too old: {0}")]
    VersionTooOld(String),
    /// Credentials rejected; retrying will not help.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A single payload could not be decoded; the item is skipped.
    #[error("decode: {0}")]
    Decode(String),
}

impl SourceError {
    /// Engine-fatal failures end the reflector instead of being retried.
    pub fn is_fatal(&self) -> bool { matches!(self, SourceError::Unauthorized(_)) }

    pub fn is_too_old(&self) -> bool { matches!(self, SourceError::VersionTooOld(_)) }
}

/// Result of a full `list()`.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<PodObject>,
    /// Baseline version to start watching from.
    pub version: ResourceVersion,
}

/// One item of a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Added(PodObject),
    Updated(PodObject),
    Deleted(PodObject),
    /// Advances the resume cursor without any object change.
    Bookmark(ResourceVersion),
    /// In-band error: the stream is no longer usable.
    Error(SourceError),
}

/// Lazy, unbounded sequence of watch events. `Err` items are transport failures.
pub type WatchStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

#[async_trait]
pub trait SourceClient: Send + Sync + 'static {
    /// Current full state plus the version it was read at.
    async fn list(&self) -> Result<Listing, SourceError>;

    /// Change events strictly after `since`.
    async fn watch(&self, since: ResourceVersion) -> Result<WatchStream, SourceError>;
}
