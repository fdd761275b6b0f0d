//! rcache - A local cache for remote read-only files
//!
//! This library caches files that live in slow remote object stores on
//! local disk, so that repeated reads are served locally. A cached file
//! is readable while it is still being downloaded: readers are handed
//! bytes up to the published frontier and block until the background
//! download catches up with them. Completed entries survive process
//! restarts through small sidecar files next to the payload.
//!
//! # Modules
//!
//! - [`config`] - Cache root, byte budget and flush threshold
//! - [`metadata`] - Pluggable descriptors identifying remote files
//! - [`cache`] - Controllers, the cache registry and reader handles

pub mod cache;
pub mod config;
pub mod metadata;

pub use cache::{
    CacheController, CacheError, CachedFileReader, FileStatus, RemoteFileCache, WaitOutcome,
};
pub use config::CacheConfig;
pub use metadata::{MetadataFactory, ObjectMetadata, RemoteFileMetadata};
