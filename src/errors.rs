use thiserror::Error;

/// Error kinds surfaced by the remap engine, named rather than numbered so callers
/// can match on them directly.
#[derive(Debug, Error)]
pub enum RemapError {
    #[error("invalid construction arguments: {0}")]
    BadArgs(String),

    #[error("failed to open backing device {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spare device too small: {spare_sectors} sectors, minimum is {minimum}")]
    SpareTooSmall { spare_sectors: u64, minimum: u64 },

    #[error("main device fingerprint does not match persisted metadata")]
    FingerprintMismatch,

    #[error("no valid metadata copy found on spare device")]
    MetadataUnreadable,

    #[error("spare allocator exhausted: requested {requested} units, {free} free")]
    AllocatorExhausted { requested: u64, free: u64 },

    #[error("backing device I/O error at sector {sector}: {source}")]
    BackingIoError {
        sector: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("all metadata copy writes failed, target is running degraded")]
    PersistenceDegraded,

    #[error("target is shutting down, request rejected")]
    ShuttingDown,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("metadata codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RemapError>;
