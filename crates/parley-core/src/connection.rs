//! Connection lifecycle.
//!
//! A [`Connection`] bridges one authenticated transport session to the
//! broker. It is bound to a single conversation and a single principal for
//! its whole life and runs two pumps:
//!
//! - the **read pump** decodes inbound frames and publishes them;
//! - the **write pump** drains the connection's bounded mailbox to the peer.
//!
//! The pumps share nothing but the mailbox. Whichever stops first ends the
//! connection: a `Leave` is submitted (harmless if the broker already
//! removed us) and the other pump is wound down.
//!
//! ```text
//! Connecting ──▶ Joined ──▶ Active ──▶ Draining ──▶ Closed
//!      │            │                                  ▲
//!      └────────────┴──────────── refused ─────────────┘
//! ```

use crate::broker::BrokerHandle;
use crate::message::{ConversationId, Message, PrincipalId};
use crate::metrics;
use crate::registry::Member;
use parley_protocol::ServerFrame;
use parley_transport::{ConnectionId, FrameSink, FrameSource};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Authenticated, not yet submitted to the broker.
    Connecting,
    /// Join submitted, awaiting the broker.
    Joined,
    /// Both pumps running.
    Active,
    /// Winding down after an error, a peer close, or eviction.
    Draining,
    /// Terminal; all resources released.
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The peer closed the session.
    PeerClosed,
    /// The peer sent a frame that could not be decoded or was invalid.
    MalformedFrame,
    /// Reading from the transport failed.
    TransportRead,
    /// Writing to the transport failed or timed out.
    TransportWrite,
    /// The broker closed the mailbox (slow consumer or shutdown).
    Evicted,
    /// The broker refused the join.
    Refused,
}

impl DisconnectReason {
    /// Short name, used for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::PeerClosed => "peer_closed",
            DisconnectReason::MalformedFrame => "malformed_frame",
            DisconnectReason::TransportRead => "transport_read",
            DisconnectReason::TransportWrite => "transport_write",
            DisconnectReason::Evicted => "evicted",
            DisconnectReason::Refused => "refused",
        }
    }

    /// Whether the disconnect indicates a fault rather than a normal close.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, DisconnectReason::PeerClosed)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound mailbox.
    pub mailbox_capacity: usize,
    /// Maximum content length of an inbound message in bytes.
    pub max_message_size: usize,
    /// Interval between transport keepalives.
    pub heartbeat_interval: Duration,
    /// Deadline for a single transport write.
    pub write_timeout: Duration,
    /// How long the write pump may take to finish its close handshake.
    pub close_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            max_message_size: 64 * 1024, // 64 KB
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// One live session bound to a conversation and a principal.
pub struct Connection {
    id: ConnectionId,
    conversation_id: ConversationId,
    principal_id: PrincipalId,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Create a connection for an authenticated principal.
    #[must_use]
    pub fn new(conversation_id: impl Into<ConversationId>, principal_id: impl Into<PrincipalId>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            id: ConnectionId::generate(),
            conversation_id: conversation_id.into(),
            principal_id: principal_id.into(),
            state,
        }
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the conversation this connection is bound to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Get the authenticated principal.
    #[must_use]
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move forward in the lifecycle. Never moves backwards or out of `Closed`.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if next <= *current {
                return false;
            }
            debug!(connection = %self.id, from = ?*current, to = ?next, "State change");
            *current = next;
            true
        })
    }

    /// Run the connection until it ends.
    ///
    /// Joins the broker, announces the connection to the peer, then runs the
    /// read pump on this task and the write pump on a spawned one.
    pub async fn run<R, W>(
        self,
        broker: &BrokerHandle,
        mut source: R,
        mut sink: W,
        config: &ConnectionConfig,
    ) -> DisconnectReason
    where
        R: FrameSource,
        W: FrameSink + 'static,
    {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let member = Member::new(self.id.clone(), self.principal_id.clone(), mailbox_tx);

        self.transition(ConnectionState::Joined);
        if !broker.join(self.conversation_id.clone(), member).accepted().await {
            warn!(
                connection = %self.id,
                conversation = %self.conversation_id,
                "Join refused by broker"
            );
            self.transition(ConnectionState::Draining);
            let _ = sink.close().await;
            return self.finish(DisconnectReason::Refused);
        }

        let hello = ServerFrame::connected(
            self.id.as_str(),
            self.conversation_id.as_str(),
            self.principal_id.as_str(),
            u32::try_from(config.heartbeat_interval.as_millis()).unwrap_or(u32::MAX),
        );
        if !matches!(timeout(config.write_timeout, sink.send(&hello)).await, Ok(Ok(()))) {
            self.transition(ConnectionState::Draining);
            broker.leave(self.conversation_id.clone(), &self.id);
            return self.finish(DisconnectReason::TransportWrite);
        }

        self.transition(ConnectionState::Active);
        debug!(
            connection = %self.id,
            conversation = %self.conversation_id,
            principal = %self.principal_id,
            "Connection active"
        );

        let mut writer = tokio::spawn(write_pump(
            self.id.clone(),
            sink,
            mailbox_rx,
            config.heartbeat_interval,
            config.write_timeout,
        ));

        let (reason, writer_done) = tokio::select! {
            reason = self.read_pump(&mut source, broker, config.max_message_size) => (reason, false),
            joined = &mut writer => (joined.unwrap_or(DisconnectReason::TransportWrite), true),
        };

        self.transition(ConnectionState::Draining);
        broker.leave(self.conversation_id.clone(), &self.id);
        drop(source);

        // The leave closes the mailbox, which tells the write pump to send
        // its close frame; give it a bounded time to do so.
        if !writer_done && timeout(config.close_grace, &mut writer).await.is_err() {
            debug!(connection = %self.id, "Write pump did not finish in time; aborting");
            writer.abort();
        }

        self.finish(reason)
    }

    async fn read_pump<R: FrameSource>(
        &self,
        source: &mut R,
        broker: &BrokerHandle,
        max_message_size: usize,
    ) -> DisconnectReason {
        loop {
            let frame = match source.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return DisconnectReason::PeerClosed,
                Err(e) if e.is_malformed() => {
                    warn!(connection = %self.id, error = %e, "Malformed frame");
                    return DisconnectReason::MalformedFrame;
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Transport read failed");
                    return DisconnectReason::TransportRead;
                }
            };

            match frame.into_content(max_message_size) {
                Ok(content) => {
                    metrics::record_message("inbound");
                    broker.publish(Message::new(
                        self.conversation_id.clone(),
                        self.principal_id.clone(),
                        content,
                    ));
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Malformed frame");
                    return DisconnectReason::MalformedFrame;
                }
            }
        }
    }

    fn finish(&self, reason: DisconnectReason) -> DisconnectReason {
        self.transition(ConnectionState::Closed);
        metrics::record_disconnect(reason.as_str());

        if reason.is_error() {
            warn!(
                connection = %self.id,
                conversation = %self.conversation_id,
                reason = %reason,
                "Connection closed"
            );
        } else {
            debug!(
                connection = %self.id,
                conversation = %self.conversation_id,
                "Connection closed by peer"
            );
        }
        reason
    }
}

async fn write_pump<W: FrameSink>(
    connection_id: ConnectionId,
    mut sink: W,
    mut mailbox: mpsc::Receiver<Arc<Message>>,
    heartbeat_interval: Duration,
    write_timeout: Duration,
) -> DisconnectReason {
    // A zero interval disables keepalives
    let mut heartbeat = Instant::now()
        .checked_add(heartbeat_interval)
        .filter(|_| !heartbeat_interval.is_zero())
        .map(|start| {
            let mut interval = tokio::time::interval_at(start, heartbeat_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

    loop {
        tokio::select! {
            message = mailbox.recv() => {
                let Some(message) = message else {
                    // Mailbox closed by the broker
                    if let Err(e) = timeout(write_timeout, sink.close()).await.unwrap_or(Ok(())) {
                        debug!(connection = %connection_id, error = %e, "Close handshake failed");
                    }
                    return DisconnectReason::Evicted;
                };

                let frame = ServerFrame::Message(message.to_frame());
                match timeout(write_timeout, sink.send(&frame)).await {
                    Ok(Ok(())) => {
                        metrics::record_message("outbound");
                        trace!(connection = %connection_id, frame = frame.kind(), "Frame written");
                    }
                    Ok(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "Transport write failed");
                        return DisconnectReason::TransportWrite;
                    }
                    Err(_) => {
                        warn!(connection = %connection_id, "Transport write timed out");
                        return DisconnectReason::TransportWrite;
                    }
                }
            }

            () = next_heartbeat(&mut heartbeat) => {
                if !matches!(timeout(write_timeout, sink.ping()).await, Ok(Ok(()))) {
                    warn!(connection = %connection_id, "Keepalive failed");
                    return DisconnectReason::TransportWrite;
                }
            }
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use crate::collaborator::Collaborators;
    use parley_transport::memory::{self, MemoryPeer, PeerEvent};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn_broker() -> BrokerHandle {
        Broker::spawn(BrokerConfig::default(), Collaborators::default()).0
    }

    /// Start a connection over an in-memory transport and wait until active.
    async fn connect(
        broker: &BrokerHandle,
        conversation_id: &str,
        principal_id: &str,
    ) -> (ConnectionId, MemoryPeer, JoinHandle<DisconnectReason>) {
        let (id, peer, task, _) =
            connect_with(broker, conversation_id, principal_id, ConnectionConfig::default()).await;
        (id, peer, task)
    }

    /// Like [`connect`], with explicit settings; also returns the announced heartbeat.
    async fn connect_with(
        broker: &BrokerHandle,
        conversation_id: &str,
        principal_id: &str,
        config: ConnectionConfig,
    ) -> (ConnectionId, MemoryPeer, JoinHandle<DisconnectReason>, u32) {
        let (source, sink, mut peer) = memory::pair();
        let connection = Connection::new(conversation_id, principal_id);
        let id = connection.id().clone();

        let broker = broker.clone();
        let task = tokio::spawn(async move {
            connection.run(&broker, source, sink, &config).await
        });

        let heartbeat = match timeout(WAIT, peer.next_frame()).await.unwrap() {
            Some(ServerFrame::Connected {
                connection_id,
                conversation_id: room,
                principal_id: principal,
                heartbeat,
                ..
            }) => {
                assert_eq!(connection_id, id.as_str());
                assert_eq!(room, conversation_id);
                assert_eq!(principal, principal_id);
                heartbeat
            }
            other => panic!("Expected Connected frame, got {:?}", other),
        };

        (id, peer, task, heartbeat)
    }

    async fn next_message(peer: &mut MemoryPeer) -> parley_protocol::MessageFrame {
        match timeout(WAIT, peer.next_frame()).await.unwrap() {
            Some(ServerFrame::Message(frame)) => frame,
            other => panic!("Expected Message frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_fans_out_to_room() {
        let broker = spawn_broker();
        let (_a, mut peer_a, _ta) = connect(&broker, "c1", "u1").await;
        let (_b, mut peer_b, _tb) = connect(&broker, "c1", "u2").await;
        let (_c, mut peer_c, _tc) = connect(&broker, "c2", "u3").await;

        assert!(peer_a.send("hello"));

        for peer in [&mut peer_a, &mut peer_b] {
            let frame = next_message(peer).await;
            assert_eq!(frame.conversation_id, "c1");
            assert_eq!(frame.sender_id, "u1");
            assert_eq!(frame.content, "hello");
        }

        broker.stats().await.unwrap();
        assert!(peer_c.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_peer_close_leaves_room() {
        let broker = spawn_broker();
        let (_id, mut peer, task) = connect(&broker, "c1", "u1").await;

        peer.close();
        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::PeerClosed);
        assert_eq!(peer.next_event().await, Some(PeerEvent::Close));
        assert_eq!(broker.room_members("c1").await, None);
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_connection() {
        let broker = spawn_broker();
        let (_a, peer_a, task) = connect(&broker, "c1", "u1").await;
        let (_b, mut peer_b, _tb) = connect(&broker, "c1", "u2").await;

        peer_a.send_text(r#"{"text":"wrong field"}"#);
        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::MalformedFrame);

        // Nothing was published and the other member is unaffected
        assert!(peer_b.try_next_event().is_none());
        assert_eq!(broker.room_members("c1").await.map(|m| m.len()), Some(1));
    }

    #[tokio::test]
    async fn test_empty_content_is_malformed() {
        let broker = spawn_broker();
        let (_id, peer, task) = connect(&broker, "c1", "u1").await;

        peer.send("");
        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::MalformedFrame);
        assert_eq!(broker.stats().await.unwrap().published, 0);
    }

    #[tokio::test]
    async fn test_read_error_ends_connection() {
        let broker = spawn_broker();
        let (_id, peer, task) = connect(&broker, "c1", "u1").await;

        peer.fail_read("connection reset");
        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::TransportRead);
        assert_eq!(broker.room_members("c1").await, None);
    }

    #[tokio::test]
    async fn test_broker_removal_closes_transport() {
        let broker = spawn_broker();
        let (id, mut peer, task) = connect(&broker, "c1", "u1").await;

        broker.leave("c1", &id);
        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::Evicted);
        assert_eq!(peer.next_event().await, Some(PeerEvent::Close));
    }

    #[tokio::test]
    async fn test_write_failure_ends_connection() {
        let broker = spawn_broker();
        let (_a, peer_a, _ta) = connect(&broker, "c1", "u1").await;
        let (_b, mut peer_b, task_b) = connect(&broker, "c1", "u2").await;

        peer_b.stop_reading();
        peer_a.send("are you there?");

        let reason = timeout(WAIT, task_b).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::TransportWrite);
        assert_eq!(broker.room_members("c1").await.map(|m| m.len()), Some(1));
    }

    #[tokio::test]
    async fn test_refused_join_closes_transport() {
        let broker = spawn_broker();
        broker.shutdown().await;

        let (source, sink, mut peer) = memory::pair();
        let connection = Connection::new("c1", "u1");
        let state = connection.subscribe_state();

        let reason = connection
            .run(&broker, source, sink, &ConnectionConfig::default())
            .await;
        assert_eq!(reason, DisconnectReason::Refused);
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        assert_eq!(peer.next_event().await, Some(PeerEvent::Close));
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_connections() {
        let broker = spawn_broker();
        let (_id, mut peer, task) = connect(&broker, "c1", "u1").await;

        broker.shutdown().await;
        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(reason, DisconnectReason::Evicted);
        assert_eq!(peer.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let broker = spawn_broker();
        let (source, sink, mut peer) = memory::pair();
        let connection = Connection::new("c1", "u1");
        assert_eq!(connection.state(), ConnectionState::Connecting);
        let mut state = connection.subscribe_state();

        let broker_for_task = broker.clone();
        let task = tokio::spawn(async move {
            connection
                .run(&broker_for_task, source, sink, &ConnectionConfig::default())
                .await
        });

        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Active))
            .await
            .unwrap()
            .unwrap();

        peer.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn test_transition_is_monotonic() {
        let connection = Connection::new("c1", "u1");
        assert!(connection.transition(ConnectionState::Active));
        assert!(!connection.transition(ConnectionState::Joined));
        assert!(connection.transition(ConnectionState::Closed));
        assert!(!connection.transition(ConnectionState::Draining));
        assert!(!connection.transition(ConnectionState::Closed));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings() {
        let broker = spawn_broker();
        let (_id, mut peer, _task) = connect(&broker, "c1", "u1").await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(peer.next_event().await, Some(PeerEvent::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_disables_pings() {
        let broker = spawn_broker();
        let config = ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            ..ConnectionConfig::default()
        };
        let (_id, mut peer, task, heartbeat) = connect_with(&broker, "c1", "u1", config).await;
        assert_eq!(heartbeat, 0);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(peer.send("still here"));

        // The first thing written after the hello is the message, not a ping
        match peer.next_event().await {
            Some(PeerEvent::Frame(ServerFrame::Message(frame))) => {
                assert_eq!(frame.content, "still here");
            }
            other => panic!("Expected Message frame, got {:?}", other),
        }
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_long_heartbeat_announced_saturated() {
        let broker = spawn_broker();
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_millis(u64::from(u32::MAX) + 1_000),
            ..ConnectionConfig::default()
        };
        let (_id, mut peer, _task, heartbeat) = connect_with(&broker, "c1", "u1", config).await;
        assert_eq!(heartbeat, u32::MAX);

        assert!(peer.send("hello"));
        assert_eq!(next_message(&mut peer).await.content, "hello");
    }
}
