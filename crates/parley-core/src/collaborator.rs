//! External collaborators notified on every accepted message.
//!
//! Persistence and cross-process fan-out are best effort: the broker hands
//! each accepted message to a dispatcher task and never waits on the result,
//! so local delivery is independent of collaborator health. The dispatcher
//! queue is bounded; when collaborators fall behind, new messages are
//! delivered locally but not forwarded.

use crate::message::Message;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Collaborator errors.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator did not answer in time.
    #[error("Collaborator timed out")]
    Timeout,

    /// The collaborator could not be reached.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the message.
    #[error("Collaborator rejected message: {0}")]
    Rejected(String),
}

/// Durable storage for accepted messages.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Append a message to the conversation history.
    async fn append(&self, message: &Message) -> Result<(), CollaboratorError>;
}

/// Forwards accepted messages to connections held by other processes.
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Publish a message beyond this process.
    async fn publish(&self, message: &Message) -> Result<(), CollaboratorError>;
}

/// A collaborator that accepts everything and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollaborator;

#[async_trait]
impl PersistenceSink for NoopCollaborator {
    async fn append(&self, _message: &Message) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[async_trait]
impl Fanout for NoopCollaborator {
    async fn publish(&self, _message: &Message) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// The collaborators wired into a broker.
#[derive(Clone)]
pub struct Collaborators {
    /// Persistence sink.
    pub persistence: Arc<dyn PersistenceSink>,
    /// Cross-process fan-out.
    pub fanout: Arc<dyn Fanout>,
}

impl Collaborators {
    /// Create a collaborator set.
    #[must_use]
    pub fn new(persistence: Arc<dyn PersistenceSink>, fanout: Arc<dyn Fanout>) -> Self {
        Self {
            persistence,
            fanout,
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(Arc::new(NoopCollaborator), Arc::new(NoopCollaborator))
    }
}

/// Hands accepted messages to the collaborators on a separate task.
pub(crate) struct Dispatcher {
    queue: mpsc::Sender<Arc<Message>>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the dispatcher task with room for `capacity` pending messages.
    pub(crate) fn spawn(collaborators: Collaborators, capacity: usize) -> Self {
        let (queue, mut pending) = mpsc::channel::<Arc<Message>>(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(message) = pending.recv().await {
                let (persisted, forwarded) = tokio::join!(
                    collaborators.persistence.append(&message),
                    collaborators.fanout.publish(&message),
                );

                if let Err(e) = persisted {
                    error!(
                        conversation = %message.conversation_id,
                        message_id = message.id,
                        error = %e,
                        "Failed to persist message"
                    );
                    metrics::record_collaborator_failure("persistence");
                }
                if let Err(e) = forwarded {
                    error!(
                        conversation = %message.conversation_id,
                        message_id = message.id,
                        error = %e,
                        "Failed to fan out message"
                    );
                    metrics::record_collaborator_failure("fanout");
                }
            }
            debug!("Collaborator dispatcher stopped");
        });

        Self { queue, task }
    }

    /// Queue a message for the collaborators. Never blocks.
    pub(crate) fn forward(&self, message: Arc<Message>) {
        match self.queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    conversation = %message.conversation_id,
                    message_id = message.id,
                    "Collaborator queue full; message not forwarded"
                );
                metrics::record_collaborator_failure("dispatcher");
            }
            Err(TrySendError::Closed(_)) => {
                error!("Collaborator dispatcher is gone; message not forwarded");
            }
        }
    }

    /// Stop accepting messages and give the queue `deadline` to drain.
    ///
    /// Work still pending after the deadline is abandoned.
    pub(crate) async fn finish(mut self, deadline: Duration) {
        drop(self.queue);
        match tokio::time::timeout(deadline, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Collaborator dispatcher panicked"),
            Err(_) => {
                warn!(
                    deadline = ?deadline,
                    "Collaborator queue did not drain in time; abandoning pending work"
                );
                self.task.abort();
            }
        }
    }
}
