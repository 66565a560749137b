//! Transport abstraction traits for Parley.
//!
//! These traits define the interface that every transport must provide,
//! allowing the connection pumps to be transport-agnostic.

use async_trait::async_trait;
use parley_protocol::{InboundFrame, ProtocolError, ServerFrame};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Process-wide counter so ids stay unique within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a transport session.
///
/// Ids are never reused: a client that reconnects gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No data arrived within the read deadline.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeded the size limit.
    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the peer sent something that could not be decoded.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TransportError::Protocol(_) | TransportError::MessageTooLarge { .. }
        )
    }
}

/// The read half of a session.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame from the peer.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError>;
}

/// The write half of a session.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the peer.
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError>;

    /// Send a transport-level keepalive.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Perform the closing handshake.
    ///
    /// Closing an already closed sink is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }

    #[test]
    fn test_malformed_classification() {
        assert!(TransportError::Protocol(ProtocolError::EmptyContent).is_malformed());
        assert!(TransportError::MessageTooLarge { size: 2, limit: 1 }.is_malformed());
        assert!(!TransportError::Timeout.is_malformed());
        assert!(!TransportError::ReceiveFailed("reset".into()).is_malformed());
    }
}
