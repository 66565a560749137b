//! Webhook collaborators.
//!
//! Posts each accepted message as JSON to a configured endpoint. The same
//! type serves as the persistence sink and as the cross-process fan-out.

use async_trait::async_trait;
use parley_core::{CollaboratorError, Fanout, Message, PersistenceSink};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Posts accepted messages to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookCollaborator {
    client: Client,
    endpoint: String,
}

impl WebhookCollaborator {
    /// Create a collaborator posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Get the endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, message: &Message) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&message.to_frame())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout
                } else {
                    CollaboratorError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "{} returned {}",
                self.endpoint, status
            )));
        }

        debug!(endpoint = %self.endpoint, message_id = message.id, "Webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for WebhookCollaborator {
    async fn append(&self, message: &Message) -> Result<(), CollaboratorError> {
        self.post(message).await
    }
}

#[async_trait]
impl Fanout for WebhookCollaborator {
    async fn publish(&self, message: &Message) -> Result<(), CollaboratorError> {
        self.post(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve a webhook endpoint that answers with `status` and reports bodies.
    async fn endpoint(status: StatusCode) -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(tx): State<mpsc::UnboundedSender<serde_json::Value>>,
                          Json(body): Json<serde_json::Value>| async move {
                        let _ = tx.send(body);
                        status
                    },
                ),
            )
            .with_state(tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), rx)
    }

    #[tokio::test]
    async fn test_posts_message_frame() {
        let (url, mut bodies) = endpoint(StatusCode::OK).await;
        let webhook = WebhookCollaborator::new(url, Duration::from_secs(5)).unwrap();

        let message = Message::new("c1", "u1", "hello");
        webhook.append(&message).await.unwrap();

        let body = bodies.recv().await.unwrap();
        assert_eq!(body["conversationId"], "c1");
        assert_eq!(body["senderId"], "u1");
        assert_eq!(body["content"], "hello");
        assert_eq!(body["id"], message.id);
    }

    #[tokio::test]
    async fn test_error_status_is_rejection() {
        let (url, _bodies) = endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
        let webhook = WebhookCollaborator::new(url, Duration::from_secs(5)).unwrap();

        let result = webhook.publish(&Message::new("c1", "u1", "hello")).await;
        assert!(matches!(result, Err(CollaboratorError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // Reserve a port, then free it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let webhook =
            WebhookCollaborator::new(format!("http://{}/hook", addr), Duration::from_secs(5))
                .unwrap();
        let result = webhook.append(&Message::new("c1", "u1", "hello")).await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }
}
