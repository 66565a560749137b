//! The broker: single owner of room membership and publish fan-out.
//!
//! Every join, leave and publish is submitted as an event to one task that
//! applies them strictly in submission order. Because that task is the only
//! code that touches the [`RoomRegistry`], membership and delivery order are
//! race-free without any locking.
//!
//! ```text
//! ┌────────────┐  join / leave / publish  ┌──────────────┐  try_send  ┌─────────┐
//! │ Connection │─────────────────────────▶│ Broker loop  │───────────▶│ Mailbox │
//! └────────────┘                          └──────────────┘            └─────────┘
//!                                                │ forward
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │ Collaborators│
//!                                         └──────────────┘
//! ```

use crate::collaborator::{Collaborators, Dispatcher};
use crate::message::{ConversationId, Message};
use crate::metrics;
use crate::registry::{JoinOutcome, Member, RoomRegistry};
use parley_transport::ConnectionId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of rooms; joins that would create more are refused.
    pub max_rooms: usize,
    /// Accepted messages buffered for the collaborators.
    pub collaborator_queue: usize,
    /// How long shutdown waits for buffered collaborator work.
    pub collaborator_drain: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_rooms: 100_000,
            collaborator_queue: 1024,
            collaborator_drain: Duration::from_secs(5),
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Joined connections.
    pub connections: usize,
    /// Messages accepted since start.
    pub published: u64,
    /// Slow consumers evicted since start.
    pub evicted: u64,
}

/// Events processed by the broker loop.
enum Event {
    Join {
        conversation_id: ConversationId,
        member: Member,
        ack: oneshot::Sender<bool>,
    },
    Leave {
        conversation_id: ConversationId,
        connection_id: ConnectionId,
    },
    Publish(Message),
    Stats(oneshot::Sender<BrokerStats>),
    Members {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Option<Vec<ConnectionId>>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Resolves once the broker has processed a join.
#[must_use = "a join ticket does nothing unless awaited"]
pub struct JoinTicket(oneshot::Receiver<bool>);

impl JoinTicket {
    /// Wait for the broker's decision.
    ///
    /// Returns `false` if the join was refused or the broker has stopped.
    pub async fn accepted(self) -> bool {
        self.0.await.unwrap_or(false)
    }
}

/// Handle for submitting events to the broker.
///
/// Submissions never block and never fail from the caller's point of view;
/// once the broker has stopped they are silently discarded.
#[derive(Clone)]
pub struct BrokerHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl BrokerHandle {
    /// Add a member to a room.
    pub fn join(&self, conversation_id: impl Into<ConversationId>, member: Member) -> JoinTicket {
        let (ack, ticket) = oneshot::channel();
        self.submit(Event::Join {
            conversation_id: conversation_id.into(),
            member,
            ack,
        });
        JoinTicket(ticket)
    }

    /// Remove a connection from a room. Leaving twice is harmless.
    pub fn leave(&self, conversation_id: impl Into<ConversationId>, connection_id: &ConnectionId) {
        self.submit(Event::Leave {
            conversation_id: conversation_id.into(),
            connection_id: connection_id.clone(),
        });
    }

    /// Fan a message out to its room.
    pub fn publish(&self, message: Message) {
        self.submit(Event::Publish(message));
    }

    /// Get broker statistics, or `None` if the broker has stopped.
    pub async fn stats(&self) -> Option<BrokerStats> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Stats(reply));
        rx.await.ok()
    }

    /// Get the connections joined to a room, or `None` if the room does not exist.
    pub async fn room_members(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Option<Vec<ConnectionId>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Members {
            conversation_id: conversation_id.into(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Drain pending events, close every mailbox and stop the broker.
    ///
    /// Resolves immediately if the broker has already begun shutting down.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        self.submit(Event::Shutdown(done));
        let _ = rx.await;
    }

    /// Check if the broker has stopped accepting events.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn submit(&self, event: Event) {
        if self.events.send(event).is_err() {
            trace!("Broker stopped; event discarded");
        }
    }
}

/// The broker event loop.
pub struct Broker {
    registry: RoomRegistry,
    config: BrokerConfig,
    events: mpsc::UnboundedReceiver<Event>,
    dispatcher: Dispatcher,
    draining: bool,
    shutdown_acks: Vec<oneshot::Sender<()>>,
    published: u64,
    evicted: u64,
}

impl Broker {
    /// Spawn the broker loop on the current runtime.
    #[must_use]
    pub fn spawn(config: BrokerConfig, collaborators: Collaborators) -> (BrokerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collaborator_queue = config.collaborator_queue;
        let broker = Self {
            registry: RoomRegistry::new(),
            config,
            events: rx,
            dispatcher: Dispatcher::spawn(collaborators, collaborator_queue),
            draining: false,
            shutdown_acks: Vec::new(),
            published: 0,
            evicted: 0,
        };

        info!("Starting broker with config: {:?}", broker.config);
        let task = tokio::spawn(broker.run());
        (BrokerHandle { events: tx }, task)
    }

    async fn run(mut self) {
        // Ends once every handle is dropped, or once the queue is closed
        // for shutdown and everything already queued has been processed.
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }

        let closed = self.registry.clear();
        metrics::set_active_rooms(0);
        self.dispatcher.finish(self.config.collaborator_drain).await;

        info!(closed_connections = closed, published = self.published, "Broker stopped");
        for done in self.shutdown_acks.drain(..) {
            let _ = done.send(());
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Join {
                conversation_id,
                member,
                ack,
            } => {
                let accepted = self.join(&conversation_id, member);
                let _ = ack.send(accepted);
            }
            Event::Leave {
                conversation_id,
                connection_id,
            } => {
                if self.registry.leave(&conversation_id, &connection_id).is_some() {
                    metrics::set_active_rooms(self.registry.room_count());
                }
            }
            Event::Publish(message) => self.publish(message),
            Event::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Event::Members {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.registry.members(&conversation_id));
            }
            Event::Shutdown(done) => {
                if !self.draining {
                    info!(
                        rooms = self.registry.room_count(),
                        connections = self.registry.connection_count(),
                        "Broker shutting down"
                    );
                    self.draining = true;
                    self.events.close();
                }
                self.shutdown_acks.push(done);
            }
        }
    }

    fn join(&mut self, conversation_id: &str, member: Member) -> bool {
        if self.draining {
            debug!(
                conversation = %conversation_id,
                connection = %member.connection_id(),
                "Join refused: broker shutting down"
            );
            return false;
        }

        if !self.registry.contains_room(conversation_id)
            && self.registry.room_count() >= self.config.max_rooms
        {
            warn!(
                conversation = %conversation_id,
                connection = %member.connection_id(),
                max_rooms = self.config.max_rooms,
                "Join refused: room limit reached"
            );
            return false;
        }

        let connection_id = member.connection_id().clone();
        match self.registry.join(conversation_id, member) {
            JoinOutcome::Joined | JoinOutcome::AlreadyJoined => {
                metrics::set_active_rooms(self.registry.room_count());
                true
            }
            JoinOutcome::Conflict(current) => {
                warn!(
                    conversation = %conversation_id,
                    connection = %connection_id,
                    current = %current,
                    "Join refused: connection already bound to another room"
                );
                false
            }
        }
    }

    fn publish(&mut self, message: Message) {
        if let Err(reason) = message.validate() {
            warn!(
                conversation = %message.conversation_id,
                sender = %message.sender_id,
                reason,
                "Dropping invalid message"
            );
            return;
        }

        let start = Instant::now();
        let message = Arc::new(message.accepted());
        let report = self.registry.deliver(&message);

        for connection_id in &report.evicted {
            warn!(
                conversation = %message.conversation_id,
                connection = %connection_id,
                "Evicted slow consumer: mailbox full"
            );
            metrics::record_eviction();
        }
        for connection_id in &report.closed {
            debug!(
                conversation = %message.conversation_id,
                connection = %connection_id,
                "Removed member with closed mailbox"
            );
        }
        if !report.evicted.is_empty() || !report.closed.is_empty() {
            metrics::set_active_rooms(self.registry.room_count());
        }

        self.published += 1;
        self.evicted += report.evicted.len() as u64;
        metrics::record_published(start.elapsed().as_secs_f64());

        trace!(
            conversation = %message.conversation_id,
            recipients = report.delivered,
            "Published message"
        );

        self.dispatcher.forward(message);
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            rooms: self.registry.room_count(),
            connections: self.registry.connection_count(),
            published: self.published,
            evicted: self.evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollaboratorError, Fanout, NoopCollaborator, PersistenceSink};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn spawn_broker() -> BrokerHandle {
        Broker::spawn(BrokerConfig::default(), Collaborators::default()).0
    }

    async fn join(
        broker: &BrokerHandle,
        conversation_id: &str,
        connection_id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<Arc<Message>> {
        let (tx, rx) = mpsc::channel(capacity);
        let member = Member::new(ConnectionId::new(connection_id), "user", tx);
        assert!(broker.join(conversation_id, member).accepted().await);
        rx
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl PersistenceSink for Recorder {
        async fn append(&self, message: &Message) -> Result<(), CollaboratorError> {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push(message.content.clone());
            if self.fail {
                return Err(CollaboratorError::Unavailable("database down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Fanout for Recorder {
        async fn publish(&self, message: &Message) -> Result<(), CollaboratorError> {
            self.seen.lock().unwrap().push(message.content.clone());
            if self.fail {
                return Err(CollaboratorError::Timeout);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_member() {
        let broker = spawn_broker();
        let mut a = join(&broker, "c1", "a", 8).await;
        let mut b = join(&broker, "c1", "b", 8).await;
        let mut c = join(&broker, "c2", "c", 8).await;

        broker.publish(Message::new("c1", "u1", "hello"));
        broker.stats().await.unwrap();

        let got_a = a.try_recv().unwrap();
        let got_b = b.try_recv().unwrap();
        assert_eq!(got_a.content, "hello");
        assert_eq!(got_a.sender_id, "u1");
        assert!(Arc::ptr_eq(&got_a, &got_b));
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_after_leave_is_not_delivered() {
        let broker = spawn_broker();
        let mut a = join(&broker, "c1", "a", 8).await;
        let _b = join(&broker, "c1", "b", 8).await;

        broker.leave("c1", &ConnectionId::new("a"));
        broker.publish(Message::new("c1", "u2", "after"));
        broker.stats().await.unwrap();

        // Mailbox closed by the leave, nothing delivered after it
        assert!(matches!(
            a.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let broker = spawn_broker();
        let mut a = join(&broker, "c1", "a", 128).await;

        for i in 0..100 {
            broker.publish(Message::new("c1", "u1", format!("m{}", i)));
        }
        broker.stats().await.unwrap();

        for i in 0..100 {
            assert_eq!(a.try_recv().unwrap().content, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_evicted_without_affecting_others() {
        let broker = spawn_broker();
        let mut d = join(&broker, "c3", "d", 1).await;
        let mut e = join(&broker, "c3", "e", 8).await;

        broker.publish(Message::new("c3", "u1", "first"));
        broker.publish(Message::new("c3", "u1", "second"));

        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.connections, 1);

        assert_eq!(e.try_recv().unwrap().content, "first");
        assert_eq!(e.try_recv().unwrap().content, "second");

        assert_eq!(d.try_recv().unwrap().content, "first");
        assert!(matches!(
            d.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(
            broker.room_members("c3").await,
            Some(vec![ConnectionId::new("e")])
        );
    }

    #[tokio::test]
    async fn test_empty_room_is_reclaimed() {
        let broker = spawn_broker();
        let _a = join(&broker, "c1", "a", 8).await;
        let _b = join(&broker, "c1", "b", 8).await;
        assert_eq!(broker.room_members("c1").await.map(|m| m.len()), Some(2));

        broker.leave("c1", &ConnectionId::new("a"));
        broker.leave("c1", &ConnectionId::new("b"));

        assert_eq!(broker.room_members("c1").await, None);
        assert_eq!(broker.stats().await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_double_leave_is_harmless() {
        let broker = spawn_broker();
        let _a = join(&broker, "c1", "a", 8).await;

        broker.leave("c1", &ConnectionId::new("a"));
        broker.leave("c1", &ConnectionId::new("a"));
        broker.leave("c9", &ConnectionId::new("missing"));

        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.rooms, 0);
        assert_eq!(stats.connections, 0);
    }

    #[tokio::test]
    async fn test_join_limit() {
        let config = BrokerConfig {
            max_rooms: 1,
            ..BrokerConfig::default()
        };
        let (broker, _task) = Broker::spawn(config, Collaborators::default());
        let _a = join(&broker, "c1", "a", 8).await;

        // Joining an existing room is still fine
        let _b = join(&broker, "c1", "b", 8).await;

        let (tx, _rx) = mpsc::channel(8);
        let member = Member::new(ConnectionId::new("c"), "user", tx);
        assert!(!broker.join("c2", member).accepted().await);
    }

    #[tokio::test]
    async fn test_invalid_message_dropped() {
        let recorder = Arc::new(Recorder::default());
        let collaborators = Collaborators::new(recorder.clone(), recorder.clone());
        let (broker, task) = Broker::spawn(BrokerConfig::default(), collaborators);
        let mut a = join(&broker, "c1", "a", 8).await;

        broker.publish(Message::new("c1", "u1", ""));
        broker.publish(Message::new("", "u1", "orphan"));
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.published, 0);
        assert!(a.try_recv().is_err());

        broker.shutdown().await;
        task.await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collaborators_called_once_per_message() {
        let persistence = Arc::new(Recorder::default());
        let fanout = Arc::new(Recorder::default());
        let collaborators = Collaborators::new(persistence.clone(), fanout.clone());
        let (broker, task) = Broker::spawn(BrokerConfig::default(), collaborators);

        let _a = join(&broker, "c1", "a", 8).await;
        let _b = join(&broker, "c1", "b", 8).await;
        broker.publish(Message::new("c1", "u1", "two members"));
        broker.publish(Message::new("empty-room", "u1", "no members"));

        broker.shutdown().await;
        task.await.unwrap();

        assert_eq!(
            *persistence.seen.lock().unwrap(),
            vec!["two members", "no members"]
        );
        assert_eq!(
            *fanout.seen.lock().unwrap(),
            vec!["two members", "no members"]
        );
    }

    #[tokio::test]
    async fn test_collaborator_failure_does_not_block_delivery() {
        let failing = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let collaborators = Collaborators::new(failing.clone(), failing.clone());
        let (broker, _task) = Broker::spawn(BrokerConfig::default(), collaborators);
        let mut a = join(&broker, "c1", "a", 8).await;

        broker.publish(Message::new("c1", "u1", "one"));
        broker.publish(Message::new("c1", "u1", "two"));
        broker.stats().await.unwrap();

        assert_eq!(a.try_recv().unwrap().content, "one");
        assert_eq!(a.try_recv().unwrap().content, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_collaborators_bound_shutdown() {
        let slow = Arc::new(Recorder {
            delay: Duration::from_secs(2),
            ..Recorder::default()
        });
        let collaborators = Collaborators::new(slow.clone(), Arc::new(NoopCollaborator));
        let config = BrokerConfig {
            collaborator_queue: 4,
            collaborator_drain: Duration::from_secs(5),
            ..BrokerConfig::default()
        };
        let (broker, task) = Broker::spawn(config, collaborators);
        let mut a = join(&broker, "c1", "a", 64).await;

        for i in 0..20 {
            broker.publish(Message::new("c1", "u1", format!("m{}", i)));
        }
        assert_eq!(broker.stats().await.unwrap().published, 20);

        // Local delivery is complete even though most were never forwarded
        for i in 0..20 {
            assert_eq!(a.try_recv().unwrap().content, format!("m{}", i));
        }

        let started = tokio::time::Instant::now();
        broker.shutdown().await;
        task.await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert!(slow.seen.lock().unwrap().len() < 20);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes_mailboxes() {
        let (broker, task) = Broker::spawn(BrokerConfig::default(), Collaborators::default());
        let mut a = join(&broker, "c1", "a", 8).await;

        broker.publish(Message::new("c1", "u1", "queued before shutdown"));
        broker.shutdown().await;

        assert_eq!(a.recv().await.unwrap().content, "queued before shutdown");
        assert!(a.recv().await.is_none());

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(broker.is_closed());

        // Joins after shutdown are refused, queries answer nothing
        let (tx, _rx) = mpsc::channel(8);
        let member = Member::new(ConnectionId::new("late"), "user", tx);
        assert!(!broker.join("c1", member).accepted().await);
        assert!(broker.stats().await.is_none());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_broker_stops_when_handles_dropped() {
        let (broker, task) = Broker::spawn(BrokerConfig::default(), Collaborators::default());
        let mut a = join(&broker, "c1", "a", 8).await;
        drop(broker);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(a.recv().await.is_none());
    }
}
