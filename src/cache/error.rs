use thiserror::Error;

/// Errors surfaced by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown metadata class: {0}")]
    UnknownMetadataClass(String),

    #[error("invalid metadata payload for class {class}")]
    InvalidMetadata { class: String },

    #[error("invalid reader handle: {0}")]
    InvalidReaderHandle(u64),

    #[error("entry of {size} bytes exceeds the cache budget of {limit} bytes")]
    ExceedsBudget { size: u64, limit: u64 },

    #[error("cache entry has been invalidated")]
    Invalidated,
}
