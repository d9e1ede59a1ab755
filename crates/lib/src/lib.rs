//!
//! lansync: serverless synchronization of tasks, time logs, goals and live
//! timers between devices on the same local network.
//!
//! ## Core Concepts
//!
//! * **Records (`record::Record`)**: Immutable snapshots of tasks, task lists, time-log entries and goals, each carrying [`record::ReplicaMetadata`] (version, origin, tombstone and the last acknowledged base).
//! * **Discovery (`discovery::Discovery`)**: UDP broadcast announcements that maintain a live table of reachable peers.
//! * **Transport (`transport::SyncTransport`)**: A WebSocket server and client exchanging JSON [`protocol::Envelope`]s, with heartbeats and reconnect backoff.
//! * **Conflict resolution (`conflict`)**: A pure two-way resolver plus a three-way merger that uses the base fields to tell fast-forwards apart from concurrent edits.
//! * **Sync engine (`sync::SyncEngine`)**: Drives push/pull per peer through a retrying job queue, a per-peer lock, payload validation and live-timer arbitration, reporting through event streams.
//! * **Storage (`storage::Storage`)**: The collaborator that persists records; [`storage::InMemoryStorage`] ships with JSON file persistence.

pub mod clock;
pub mod config;
pub mod conflict;
pub mod discovery;
pub mod protocol;
pub mod record;
pub mod storage;
pub mod sync;
pub mod transport;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::SyncConfig;
pub use record::{EntityType, Record, ReplicaMetadata};
pub use sync::{
    SyncEngine,
    error::SyncError,
    peer_types::{PeerId, PeerInfo},
};

/// Result type used throughout the lansync library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the lansync library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured sync errors from the sync, transport and discovery modules
    #[error(transparent)]
    Sync(sync::error::SyncError),

    /// Structured storage errors from the storage module
    #[error(transparent)]
    Storage(storage::StorageError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Sync(_) => "sync",
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Sync(sync_err) => sync_err.is_not_found(),
            Error::Storage(storage_err) => storage_err.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is I/O related.
    pub fn is_io_error(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Storage(storage_err) => storage_err.is_io_error(),
            _ => false,
        }
    }

    /// Check if this error is validation-related.
    pub fn is_validation_error(&self) -> bool {
        match self {
            Error::Sync(sync_err) => sync_err.is_validation_error(),
            _ => false,
        }
    }

    /// Check if this error is network-related.
    pub fn is_network_error(&self) -> bool {
        match self {
            Error::Sync(sync_err) => sync_err.is_network_error(),
            _ => false,
        }
    }

    /// Check if this error is sync-related.
    pub fn is_sync_error(&self) -> bool {
        matches!(self, Error::Sync(_))
    }

    /// Check if this error is storage-related.
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Whether the failed operation may succeed if retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Sync(sync_err) => sync_err.is_recoverable(),
            Error::Serialize(_) => false,
            Error::Io(_) | Error::Storage(_) => true,
        }
    }
}

// Conversions from module-specific errors to the main Error type
impl From<sync::error::SyncError> for Error {
    fn from(err: sync::error::SyncError) -> Self {
        Error::Sync(err)
    }
}

impl From<storage::StorageError> for Error {
    fn from(err: storage::StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<Error> for sync::error::SyncError {
    fn from(err: Error) -> Self {
        match err {
            Error::Sync(sync_err) => sync_err,
            Error::Storage(storage_err) => sync::error::SyncError::StorageError(storage_err.to_string()),
            Error::Serialize(json_err) => json_err.into(),
            Error::Io(io_err) => io_err.into(),
        }
    }
}
