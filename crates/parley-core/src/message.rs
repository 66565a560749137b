//! Chat message model.
//!
//! A [`Message`] is one utterance in one conversation. It is created by a
//! connection's read pump (or the HTTP publish endpoint), stamped by the
//! broker when accepted, and immutable from then on.

use parley_protocol::MessageFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum conversation id length.
pub const MAX_CONVERSATION_ID_LENGTH: usize = 256;

/// A conversation (room) identifier.
pub type ConversationId = String;

/// An authenticated user identifier.
pub type PrincipalId = String;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Upper bits carry the timestamp, lower 20 bits the counter
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
    (now_millis() << 20) | counter
}

/// Validate a conversation id.
///
/// # Errors
///
/// Returns an error message if the id is invalid.
pub fn validate_conversation_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Conversation id cannot be empty");
    }
    if id.len() > MAX_CONVERSATION_ID_LENGTH {
        return Err("Conversation id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("Conversation id contains invalid characters");
    }
    Ok(())
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Principal that produced the message.
    pub sender_id: PrincipalId,
    /// Message text.
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<PrincipalId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    /// Check that the message names a room and carries content.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        validate_conversation_id(&self.conversation_id)?;
        if self.content.is_empty() {
            return Err("Message content cannot be empty");
        }
        Ok(())
    }

    /// Stamp the message with its acceptance time.
    #[must_use]
    pub(crate) fn accepted(mut self) -> Self {
        self.timestamp = now_millis();
        self
    }

    /// Convert to its wire representation.
    #[must_use]
    pub fn to_frame(&self) -> MessageFrame {
        MessageFrame {
            id: self.id,
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }
}
