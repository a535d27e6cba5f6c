//! Error taxonomy for transport operations
//!
//! Every public operation returns [`TransportResult`]. Errors are `Clone` so a
//! captured fatal error can be handed back to every later caller and fanned out
//! to every pending waiter.

use crate::config::ConfigError;
use crate::transport::mqtt::state::TransportState;
use thiserror::Error;

/// Main error type for transport, subscription, twin and pool operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: TransportState },

    #[error("Transport is closed and cannot be reused")]
    AlreadyClosed,

    #[error("Transport faulted: {reason}")]
    Faulted { reason: String },

    #[error("Lock token is stale or never existed: {lock_token}")]
    StaleOrInvalidToken { lock_token: String },

    #[error("No messages are pending acknowledgment")]
    NoPendingAcks,

    #[error(
        "Acknowledgments must be sent in receive order. Expected lock token: '{expected}'; actual lock token: '{actual}'"
    )]
    OutOfOrderCompletion { expected: String, actual: String },

    #[error("Operation not supported by this protocol: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Service rejected the request with status {status}")]
    ServiceRejected { status: u16 },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Fatal I/O failure: {0}")]
    FatalIo(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Application callback failed: {0}")]
    CallbackFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl TransportError {
    /// Whether a retry policy may attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout(_))
    }

    /// Whether this error must force the owning transport into its terminal error state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalIo(_) | Self::Faulted { .. } | Self::CallbackFailed(_)
        )
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout(operation.into())
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::TransientIo(message.into())
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::FatalIo(message.into())
    }

    pub fn faulted<S: Into<String>>(reason: S) -> Self {
        Self::Faulted {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
