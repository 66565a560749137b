//! Shared setup for the Parley benchmarks.

use parley_core::{BrokerHandle, ConnectionId, Member, Message, RoomRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A mailbox receiver, as held by a connection's write pump.
pub type Mailbox = mpsc::Receiver<Arc<Message>>;

fn member(index: usize, capacity: usize) -> (Member, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity);
    let member = Member::new(
        ConnectionId::new(format!("bench-conn-{}", index)),
        format!("bench-user-{}", index),
        tx,
    );
    (member, rx)
}

/// Add `members` connections to a room directly in a registry.
pub fn populate(
    registry: &mut RoomRegistry,
    conversation_id: &str,
    members: usize,
    capacity: usize,
) -> Vec<Mailbox> {
    (0..members)
        .map(|i| {
            let (member, rx) = member(i, capacity);
            registry.join(conversation_id, member);
            rx
        })
        .collect()
}

/// Join `members` connections to a room through the broker.
pub async fn join_all(
    broker: &BrokerHandle,
    conversation_id: &str,
    members: usize,
    capacity: usize,
) -> Vec<Mailbox> {
    let mut mailboxes = Vec::with_capacity(members);
    for i in 0..members {
        let (member, rx) = member(i, capacity);
        assert!(
            broker.join(conversation_id, member).accepted().await,
            "benchmark join refused"
        );
        mailboxes.push(rx);
    }
    mailboxes
}

/// Drain every mailbox without waiting.
pub fn drain(mailboxes: &mut [Mailbox]) -> usize {
    let mut received = 0;
    for rx in mailboxes {
        while rx.try_recv().is_ok() {
            received += 1;
        }
    }
    received
}
