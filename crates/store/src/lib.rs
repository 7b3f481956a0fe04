//! Podwatch store: the coalescing delta queue and the local cache it feeds.

#![forbid(unsafe_code)]

mod cache;
mod queue;

pub use cache::{CacheSnapshot, LocalStore, StoreReader, Upsert};
pub use queue::{DeltaQueue, Pop};
