//! Metadata descriptors for remote files.
//!
//! A descriptor identifies one remote file: a class tag naming the
//! descriptor kind, an opaque version token, the remote address, and
//! the exact byte length. Descriptors round-trip through a string form
//! that is persisted next to the cached payload (`metadata.txt`) and
//! parsed again on recovery.
//!
//! Descriptor kinds are pluggable. A [`MetadataFactory`] maps class
//! tags to constructors and is built explicitly at startup, then handed
//! to the cache, so registration cannot race recovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::cache::CacheError;

/// Metadata describing one remote file.
///
/// Implementations are immutable after construction. The string
/// returned by [`serialize`](Self::serialize) must be accepted by the
/// constructor registered for the same class tag and reproduce every
/// exposed field.
pub trait RemoteFileMetadata: fmt::Debug + Send + Sync {
    /// Class tag identifying the descriptor kind.
    fn class_name(&self) -> &'static str;

    /// Opaque remote address; the caller knows how to read it.
    fn remote_path(&self) -> &str;

    /// Opaque version token. Two descriptors whose tokens differ
    /// describe different revisions of the remote file.
    fn version(&self) -> &str;

    /// Exact byte length of the remote file.
    fn file_size(&self) -> u64;

    /// Serialized form written to `metadata.txt`.
    fn serialize(&self) -> String;
}

/// Constructor for one descriptor kind.
///
/// Parses the `metadata.txt` payload; `None` means the payload is not a
/// valid serialization of this kind.
pub type MetadataConstructor =
    Box<dyn Fn(&str) -> Option<Arc<dyn RemoteFileMetadata>> + Send + Sync>;

/// Registry of descriptor constructors keyed by class tag.
#[derive(Default)]
pub struct MetadataFactory {
    constructors: HashMap<&'static str, MetadataConstructor>,
}

impl MetadataFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with the built-in descriptor kinds registered.
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(
            ObjectMetadata::CLASS_NAME,
            Box::new(|raw| {
                ObjectMetadata::parse(raw).map(|m| Arc::new(m) as Arc<dyn RemoteFileMetadata>)
            }),
        );
        factory
    }

    /// Registers a constructor for `class_name`, replacing any previous
    /// registration of the same tag.
    pub fn register(&mut self, class_name: &'static str, constructor: MetadataConstructor) {
        self.constructors.insert(class_name, constructor);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    /// Parses a `metadata.txt` payload of the given class.
    ///
    /// An unregistered class tag and a payload the constructor rejects
    /// are distinct errors; recovery deletes the entry directory in
    /// both cases.
    pub fn parse(
        &self,
        class_name: &str,
        raw: &str,
    ) -> Result<Arc<dyn RemoteFileMetadata>, CacheError> {
        let constructor = self
            .constructors
            .get(class_name)
            .ok_or_else(|| CacheError::UnknownMetadataClass(class_name.to_string()))?;
        constructor(raw).ok_or_else(|| CacheError::InvalidMetadata {
            class: class_name.to_string(),
        })
    }
}

impl fmt::Debug for MetadataFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataFactory")
            .field("classes", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Descriptor for a plain remote object: an address, an opaque version
/// token (an ETag or a modification stamp) and an exact size.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectMetadata {
    remote_path: String,
    version: String,
    file_size: u64,
}

impl ObjectMetadata {
    pub const CLASS_NAME: &'static str = "object";

    pub fn new(remote_path: impl Into<String>, version: impl Into<String>, file_size: u64) -> Self {
        Self {
            remote_path: remote_path.into(),
            version: version.into(),
            file_size,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

impl RemoteFileMetadata for ObjectMetadata {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn remote_path(&self) -> &str {
        &self.remote_path
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn serialize(&self) -> String {
        serde_json::json!({
            "remote_path": self.remote_path,
            "version": self.version,
            "file_size": self.file_size,
        })
        .to_string()
    }
}
