//! Podwatch core types: keys, versions, pod records, queue deltas and the
//! capabilities (source client, event handler) the engine is wired with.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod handler;
pub mod source;

pub use handler::{ResourceEventHandler, ResourceEventHandlerFns};
pub use source::{Listing, SourceClient, SourceError, SourceEvent, WatchStream};

/// Stable identity of a watched object within the watched scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Monotonic change-history token issued by the source.
///
/// Kubernetes hands these out as decimal strings backed by the etcd revision;
/// they are parsed once at the edge so ordering checks are plain integer compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl FromStr for ResourceVersion {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| SourceError::Decode(format!("resourceVersion {:?} is not numeric", s)))
    }
}

/// The watched object. Only the fields the handlers display are carried;
/// the engine itself treats it as an opaque value bound to a key and a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodObject {
    pub key: ResourceKey,
    pub uid: String,
    pub version: ResourceVersion,
    /// Pod IP; empty until the pod is scheduled and networked.
    pub ip: String,
    pub phase: String,
    pub node: Option<String>,
}

impl PodObject {
    pub fn namespace(&self) -> &str { &self.key.namespace }
    pub fn name(&self) -> &str { &self.key.name }

    /// Same object content, ignoring the version token.
    pub fn same_content(&self, other: &PodObject) -> bool {
        self.key == other.key
            && self.uid == other.uid
            && self.ip == other.ip
            && self.phase == other.phase
            && self.node == other.node
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    /// Listed or watched Added/Updated state; applied as an upsert.
    Upsert,
    /// Deletion observed on the watch stream.
    Deleted,
    /// Deletion inferred by a relist: the key vanished between listings.
    Tombstone,
    /// Periodic resync re-delivery of the stored state.
    Sync,
}

/// A pending change for one key, as held by the delta queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub key: ResourceKey,
    /// Object carried by the change; for deletions this is the last state known
    /// to the producer, used when the store has no record of the key.
    pub object: Option<PodObject>,
    pub version: ResourceVersion,
}

impl Delta {
    pub fn upsert(obj: PodObject) -> Self {
        Self { kind: DeltaKind::Upsert, key: obj.key.clone(), version: obj.version, object: Some(obj) }
    }

    pub fn deleted(obj: PodObject) -> Self {
        Self { kind: DeltaKind::Deleted, key: obj.key.clone(), version: obj.version, object: Some(obj) }
    }

    pub fn tombstone(key: ResourceKey, last_known: Option<PodObject>, version: ResourceVersion) -> Self {
        Self { kind: DeltaKind::Tombstone, key, object: last_known, version }
    }

    pub fn sync(obj: PodObject) -> Self {
        Self { kind: DeltaKind::Sync, key: obj.key.clone(), version: obj.version, object: Some(obj) }
    }
}

/// What a delete notification carries: either the live object, or a
/// placeholder when the final state was not observed directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletedObject {
    Known(PodObject),
    Tombstone { key: ResourceKey, last_known: Option<PodObject> },
}

impl DeletedObject {
    pub fn key(&self) -> &ResourceKey {
        match self {
            DeletedObject::Known(o) => &o.key,
            DeletedObject::Tombstone { key, .. } => key,
        }
    }

    /// Best available object content for the deleted key.
    pub fn object(&self) -> Option<&PodObject> {
        match self {
            DeletedObject::Known(o) => Some(o),
            DeletedObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }

    pub fn is_tombstone(&self) -> bool { matches!(self, DeletedObject::Tombstone { .. }) }
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, DeletedObject, Listing, PodObject, ResourceEventHandler, ResourceKey,
        ResourceVersion, SourceClient, SourceError, SourceEvent, WatchStream,
    };
}
