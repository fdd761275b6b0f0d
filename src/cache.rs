//! Local caching of remote read-only files.
//!
//! One cached file is a directory holding the payload (`data.bin`), the
//! serialized descriptor (`metadata.txt`) and a status snapshot
//! (`info.txt`). A [`CacheController`] coordinates the background
//! download of one entry with the readers served from it; the
//! [`RemoteFileCache`] registry owns the controllers, enforces the byte
//! budget and recovers completed entries on startup.
//!
//! # Components
//!
//! - [`CacheController`] - Per-entry download and read coordination
//! - [`RemoteFileCache`] - Registry with LRU eviction and recovery
//! - [`CachedFileReader`] - Seekable reader over one entry's payload
//! - [`CacheError`] - Error kinds surfaced by the cache

mod controller;
mod error;
mod reader;
mod registry;

#[cfg(test)]
mod tests;

pub use controller::{CacheController, FileStatus, WaitOutcome};
pub use error::CacheError;
pub use reader::CachedFileReader;
pub use registry::RemoteFileCache;
