//! Error types for the synchronization engine.
//!
//! Every failure the engine can hit maps onto one [`SyncError`] variant. Each
//! variant knows whether it is recoverable (retry or drop the offending
//! payload and carry on) and whether it should be surfaced to the user.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::peer_types::PeerId;

/// Errors that can occur during synchronization operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// No usable network interface.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A connection or handshake did not complete in time.
    #[error("Connection to {address} timed out")]
    ConnectionTimeout { address: String },

    /// Client connection error.
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// An established connection went away.
    #[error("Connection to {peer} lost")]
    ConnectionLost { peer: PeerId },

    /// Peer is not known to the transport.
    #[error("Device not found: {0}")]
    DeviceNotFound(PeerId),

    /// Peer is known but currently unreachable.
    #[error("Device offline: {0}")]
    DeviceOffline(PeerId),

    /// Peer rejected the operation because it is busy.
    #[error("Device busy: {0}")]
    DeviceBusy(PeerId),

    /// Payload could not be decoded (bad compression envelope, broken JSON).
    #[error("Data corrupted: {0}")]
    DataCorrupted(String),

    /// A conflict was detected that needs attention.
    #[error("Data conflict: {0}")]
    DataConflict(String),

    /// Payload failed schema validation.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Payload exceeds the configured size limit.
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge { size: usize, limit: usize },

    /// Every candidate port was taken.
    #[error("Port {port} in use (tried {attempts} ports)")]
    PortInUse { port: u16, attempts: u16 },

    /// The OS refused a socket operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A channel or queue is full.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine was stopped while the operation ran.
    #[error("Operation cancelled")]
    OperationCancelled,

    /// A request did not receive its response in time.
    #[error("Operation timed out: {0}")]
    OperationTimeout(String),

    /// Another sync with the same peer holds the lock.
    #[error("Sync with {peer} already in progress")]
    OperationInProgress { peer: PeerId },

    /// Attempted to start a server when one is already running.
    #[error("Server already running on {address}")]
    ServerAlreadyRunning { address: String },

    /// Attempted to stop a server when none is running.
    #[error("Server not running")]
    ServerNotRunning,

    /// Server bind error.
    #[error("Failed to bind server to {address}: {reason}")]
    ServerBind { address: String, reason: String },

    /// Discovery socket could not be set up.
    #[error("Discovery unavailable: {0}")]
    Discovery(String),

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Unexpected message type received from peer.
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Storage collaborator error.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// The engine has not been started.
    #[error("Sync engine not running")]
    NotRunning,

    /// Remote peer reported an error.
    #[error("Peer {peer} reported {kind:?}: {message}")]
    Remote {
        peer: PeerId,
        kind: ErrorKind,
        message: String,
    },

    /// Anything else.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Wire-level error classification.
///
/// Carried in `error` messages and error events so remote peers and the UI
/// can react without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NetworkUnavailable,
    ConnectionTimeout,
    ConnectionFailed,
    ConnectionLost,
    DeviceNotFound,
    DeviceOffline,
    DeviceBusy,
    DataCorrupted,
    DataConflict,
    ValidationFailed,
    DataTooLarge,
    PortInUse,
    PermissionDenied,
    ResourceExhausted,
    OperationCancelled,
    OperationTimeout,
    OperationInProgress,
    Unknown,
}

impl SyncError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NetworkUnavailable(_) | SyncError::Discovery(_) => {
                ErrorKind::NetworkUnavailable
            }
            SyncError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            SyncError::ConnectionFailed { .. } | SyncError::HandshakeFailed(_) => {
                ErrorKind::ConnectionFailed
            }
            SyncError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            SyncError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            SyncError::DeviceOffline(_) => ErrorKind::DeviceOffline,
            SyncError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            SyncError::DataCorrupted(_)
            | SyncError::SerializationError(_)
            | SyncError::UnexpectedMessage { .. } => ErrorKind::DataCorrupted,
            SyncError::DataConflict(_) => ErrorKind::DataConflict,
            SyncError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            SyncError::DataTooLarge { .. } => ErrorKind::DataTooLarge,
            SyncError::PortInUse { .. }
            | SyncError::ServerBind { .. }
            | SyncError::ServerAlreadyRunning { .. } => ErrorKind::PortInUse,
            SyncError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SyncError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SyncError::OperationCancelled | SyncError::NotRunning => {
                ErrorKind::OperationCancelled
            }
            SyncError::OperationTimeout(_) => ErrorKind::OperationTimeout,
            SyncError::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            SyncError::Remote { kind, .. } => *kind,
            SyncError::ServerNotRunning
            | SyncError::StorageError(_)
            | SyncError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the failed operation may succeed if tried again later.
    ///
    /// Non-recoverable errors are never retried: the payload or request is
    /// wrong and will stay wrong.
    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }

    /// Whether this error should reach the user, rather than only the log.
    pub fn should_surface(&self) -> bool {
        self.kind().should_surface()
    }

    /// Check if this is a network/connection error.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkUnavailable
                | ErrorKind::ConnectionTimeout
                | ErrorKind::ConnectionFailed
                | ErrorKind::ConnectionLost
                | ErrorKind::DeviceOffline
        )
    }

    /// Check if this is a server lifecycle error.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            SyncError::ServerAlreadyRunning { .. }
                | SyncError::ServerNotRunning
                | SyncError::ServerBind { .. }
                | SyncError::PortInUse { .. }
        )
    }

    /// Check if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::DeviceNotFound(_))
    }

    /// Check if this is a validation error.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, SyncError::ValidationFailed(_))
    }

    /// Check if the Sync Lock rejected the request.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, SyncError::OperationInProgress { .. })
    }
}

impl ErrorKind {
    /// See [`SyncError::is_recoverable`].
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorKind::ValidationFailed
                | ErrorKind::DataTooLarge
                | ErrorKind::PermissionDenied
                | ErrorKind::OperationCancelled
        )
    }

    /// See [`SyncError::should_surface`].
    ///
    /// Auto-resolved conflicts, port fallback and lock contention are logged
    /// only.
    pub fn should_surface(self) -> bool {
        !matches!(
            self,
            ErrorKind::DataConflict
                | ErrorKind::OperationInProgress
                | ErrorKind::OperationCancelled
                | ErrorKind::ConnectionLost
                | ErrorKind::DataCorrupted
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => SyncError::PermissionDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => SyncError::OperationTimeout(err.to_string()),
            std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::AddrNotAvailable => {
                SyncError::NetworkUnavailable(err.to_string())
            }
            _ => SyncError::Unknown(err.to_string()),
        }
    }
}
