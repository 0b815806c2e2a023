//! Core type definitions for DMS connection handling.

use std::fmt;

/// Correlation id of a command.
///
/// The DMS echoes it in every response to the command and, for
/// subscriptions, in every event. Fresh tags are ULIDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    /// Generate a new unique tag using ULID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Tag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Counter of physical connections made by one client.
///
/// Each successful (re)connect starts a new generation; state belonging to
/// an older generation is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Opening the websocket.
    Connecting,
    /// Ready for traffic.
    Connected,
    /// Shutting down on request of the application.
    Closing,
    /// The connection was lost or could not be opened.
    Failed,
}

impl ConnectionState {
    /// Check if the connection is ready for traffic.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Snapshot of the connection: state and current generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: Generation,
}

impl ConnectionStatus {
    pub(crate) fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: Generation(0),
        }
    }
}
