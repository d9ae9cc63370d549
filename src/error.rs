//! Error taxonomy.
//!
//! I/O and corruption errors are meant to be contained at component
//! boundaries — callers of the storage/query layers degrade to partial
//! availability rather than propagate a hard failure. `ValidationError` and
//! `ConfigInvalid` are the two variants that are expected to reach the
//! caller directly.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or incomplete event; surfaced to the caller, never
    /// persisted.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A frame or segment failed its CRC or structural check. The segment
    /// is flagged, the writer continues in a new segment, and readers see
    /// the preceding frames plus a `quarantined` warning.
    #[error("corrupt data at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    /// A read encountered a shorter frame/file than its header promised.
    #[error("truncated frame at offset {offset}")]
    Truncated { offset: u64 },

    /// A segment's on-disk format version isn't one this build
    /// understands.
    #[error("unknown segment format version: {0}")]
    UnknownVersion(u16),

    /// The bounded ingest channel is full and the writer is configured to
    /// drop rather than block.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Rejected configuration; the store refuses to start or reload.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A component failed to stop within its shutdown deadline. Non-fatal:
    /// reported and logged, shutdown proceeds for remaining components.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),

    /// A query by id found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient or fatal I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying storage is unavailable after repeated transient I/O
    /// failures past the configured threshold.
    #[error("storage degraded: {0}")]
    StorageDegraded(String),

    /// Catch-all for storage-engine failures that don't fit a more
    /// specific variant above.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
