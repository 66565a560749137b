//! Room membership bookkeeping.
//!
//! The registry maps each conversation to the connections currently joined
//! to it. It is a plain data structure with no interior synchronization:
//! the broker's event loop is its only owner.
//!
//! Each [`Member`] holds the only sender for its connection's mailbox, so
//! removing a member from the registry is what closes that mailbox.

use crate::message::{ConversationId, Message, PrincipalId};
use parley_transport::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// A connection as seen by the registry.
#[derive(Debug)]
pub struct Member {
    connection_id: ConnectionId,
    principal_id: PrincipalId,
    mailbox: mpsc::Sender<Arc<Message>>,
}

impl Member {
    /// Create a member from a connection's identity and mailbox sender.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        principal_id: impl Into<PrincipalId>,
        mailbox: mpsc::Sender<Arc<Message>>,
    ) -> Self {
        Self {
            connection_id,
            principal_id: principal_id.into(),
            mailbox,
        }
    }

    /// The member's connection id.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The principal bound to the member's connection.
    #[must_use]
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }
}

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection was added to the room.
    Joined,
    /// The connection was already a member of this room.
    AlreadyJoined,
    /// The connection is a member of another room.
    Conflict(ConversationId),
}

/// Result of fanning one message out to a room.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members whose mailbox accepted the message.
    pub delivered: usize,
    /// Members evicted because their mailbox was full.
    pub evicted: Vec<ConnectionId>,
    /// Members removed because their connection had already gone away.
    pub closed: Vec<ConnectionId>,
}

/// Mapping from conversation id to the connections joined to it.
///
/// A room entry exists if and only if it has at least one member, and a
/// connection is a member of at most one room.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<ConversationId, HashMap<ConnectionId, Member>>,
    /// Reverse index: connection -> the room it belongs to.
    index: HashMap<ConnectionId, ConversationId>,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member to a room, creating the room if absent.
    pub fn join(&mut self, conversation_id: &str, member: Member) -> JoinOutcome {
        if let Some(current) = self.index.get(member.connection_id()) {
            if current != conversation_id {
                return JoinOutcome::Conflict(current.clone());
            }
            return JoinOutcome::AlreadyJoined;
        }

        let connection_id = member.connection_id().clone();
        let room = self.rooms.entry(conversation_id.to_string()).or_default();
        room.insert(connection_id.clone(), member);
        self.index
            .insert(connection_id.clone(), conversation_id.to_string());

        debug!(
            conversation = %conversation_id,
            connection = %connection_id,
            members = room.len(),
            "Joined room"
        );
        JoinOutcome::Joined
    }

    /// Remove a member from a room, deleting the room once it is empty.
    ///
    /// Returns the removed member, or `None` if it was not in that room.
    /// Dropping the returned member closes its mailbox.
    pub fn leave(&mut self, conversation_id: &str, connection_id: &ConnectionId) -> Option<Member> {
        let room = self.rooms.get_mut(conversation_id)?;
        let member = room.remove(connection_id)?;
        self.index.remove(connection_id);

        debug!(
            conversation = %conversation_id,
            connection = %connection_id,
            principal = %member.principal_id(),
            members = room.len(),
            "Left room"
        );

        if room.is_empty() {
            self.rooms.remove(conversation_id);
            debug!(conversation = %conversation_id, "Deleted empty room");
        }

        Some(member)
    }

    /// Offer a message to every member of its room without waiting.
    ///
    /// Members whose mailbox is full are evicted; members whose connection
    /// has already dropped its mailbox are removed. Either way the rest of
    /// the room still receives the message.
    pub fn deliver(&mut self, message: &Arc<Message>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(room) = self.rooms.get(&message.conversation_id) else {
            return report;
        };

        for (connection_id, member) in room {
            match member.mailbox.try_send(Arc::clone(message)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.evicted.push(connection_id.clone()),
                Err(TrySendError::Closed(_)) => report.closed.push(connection_id.clone()),
            }
        }

        for connection_id in report.evicted.iter().chain(&report.closed) {
            self.leave(&message.conversation_id, connection_id);
        }

        report
    }

    /// Get the connection ids joined to a room.
    #[must_use]
    pub fn members(&self, conversation_id: &str) -> Option<Vec<ConnectionId>> {
        self.rooms
            .get(conversation_id)
            .map(|room| room.keys().cloned().collect())
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains_room(&self, conversation_id: &str) -> bool {
        self.rooms.contains_key(conversation_id)
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of joined connections across all rooms.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.index.len()
    }

    /// Remove every member, closing all mailboxes.
    ///
    /// Returns the number of members removed.
    pub fn clear(&mut self) -> usize {
        let count = self.index.len();
        self.rooms.clear();
        self.index.clear();
        count
    }
}
