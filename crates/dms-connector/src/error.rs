//! Error handling for the DMS protocol engine.
//!
//! Transport failures and malformed frames are contained inside the
//! connection driver and surface to callers only as one of these kinds.

use std::time::Duration;

use thiserror::Error;

use crate::{messages::ResponseCode, websocket::ConnectionState};

/// The main result type used throughout the connector.
pub type DmsResult<T> = Result<T, DmsError>;

/// Every failure a caller of the connector can observe.
///
/// The type is `Clone` so a single terminal error (for example a lost
/// connection) can be handed to every waiter of a generation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DmsError {
    /// An outbound request is malformed. Not retryable; fix the payload.
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// An inbound frame or response body could not be decoded.
    #[error("Decoding error: {message}")]
    Decoding { message: String },

    /// The DMS answered a request with a non-ok response code.
    #[error("DMS rejected request {tag}: {code}{}", .message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default())]
    Protocol {
        code: ResponseCode,
        message: Option<String>,
        tag: String,
    },

    /// No response arrived within the local deadline.
    #[error("Request {tag} timed out after {duration:?}")]
    RequestTimeout { duration: Duration, tag: String },

    /// The operation needs a connected session.
    #[error("Not connected (state: {state:?})")]
    NotConnected { state: ConnectionState },

    /// The connection of the current generation went away.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The websocket could not be established.
    #[error("Connect failed: {reason}")]
    ConnectFailed { reason: String },

    /// The pending request was cancelled locally.
    #[error("Request {tag} was cancelled")]
    Cancelled { tag: String },

    /// A tag is already in use by another in-flight request.
    #[error("Tag {tag} is already pending")]
    DuplicateTag { tag: String },

    /// Too many requests are in flight.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DmsError {
    /// Create an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Create a connection-lost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create a connect failure.
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    /// Create a request timeout error.
    pub fn request_timeout(duration: Duration, tag: impl Into<String>) -> Self {
        Self::RequestTimeout {
            duration,
            tag: tag.into(),
        }
    }

    /// Create a capacity error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error ends the current connection generation.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::ConnectFailed { .. } | Self::NotConnected { .. }
        )
    }
}
