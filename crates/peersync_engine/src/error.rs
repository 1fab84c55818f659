//! Error types for the sync engine.

use peersync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these cross the [`SyncOrchestrator`](crate::SyncOrchestrator)
/// boundary; they are logged there and turned into boolean outcomes.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Socket or file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Wire data could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The local store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// The central store rejected an operation.
    #[error("central store error: {0}")]
    Central(String),

    /// A required setting is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid lifecycle transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Operation was cancelled by shutdown.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the next scheduled cycle may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Io(_) => true,
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Central(_) => true,
            _ => false,
        }
    }

    /// Returns true for timeouts, including I/O timeouts surfaced by sockets.
    pub fn is_timeout(&self) -> bool {
        match self {
            SyncError::Timeout => true,
            SyncError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
