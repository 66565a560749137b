//! Frame types for the Parley protocol.
//!
//! The client only ever sends message content; everything else about a
//! message (room, sender, id, timestamp) is implied by the connection and
//! assigned by the server.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::version::Version;

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Message text.
    pub content: String,
}

impl InboundFrame {
    /// Create a new inbound frame.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Validate the frame and take its content.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is empty or longer than `max_len` bytes.
    pub fn into_content(self, max_len: usize) -> Result<String, ProtocolError> {
        if self.content.is_empty() {
            return Err(ProtocolError::EmptyContent);
        }
        if self.content.len() > max_len {
            return Err(ProtocolError::ContentTooLarge {
                size: self.content.len(),
                limit: max_len,
            });
        }
        Ok(self.content)
    }
}

/// A chat message as delivered to clients and collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    /// Server-assigned message id.
    pub id: u64,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Authenticated sender.
    pub sender_id: String,
    /// Message text.
    pub content: String,
    /// Acceptance time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// The connection has been admitted to its conversation.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Conversation this connection is bound to.
        conversation_id: String,
        /// Authenticated principal.
        principal_id: String,
        /// Server protocol version.
        version: Version,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A delivered chat message.
    #[serde(rename = "message")]
    Message(MessageFrame),
}

impl ServerFrame {
    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        conversation_id: impl Into<String>,
        principal_id: impl Into<String>,
        heartbeat: u32,
    ) -> Self {
        ServerFrame::Connected {
            connection_id: connection_id.into(),
            conversation_id: conversation_id.into(),
            principal_id: principal_id.into(),
            version: Version::default(),
            heartbeat,
        }
    }

    /// Short name of the frame, used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Message(_) => "message",
        }
    }
}
