//! Connection handlers for Parley server.
//!
//! This module authenticates upgrade requests, hands upgraded sockets to the
//! connection lifecycle, and serves the publish-only and health endpoints.

use crate::auth::{self, HandshakeError, HandshakeQuery, HandshakeRequest, JwtVerifier, TokenVerifier};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::webhook::WebhookCollaborator;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parley_core::message::validate_conversation_id;
use parley_core::{
    Broker, BrokerHandle, Collaborators, Connection, Fanout, Message, NoopCollaborator,
    PersistenceSink,
};
use parley_protocol::{InboundFrame, PROTOCOL_VERSION};
use parley_transport::websocket;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the broker loop.
    pub broker: BrokerHandle,
    /// Verifies handshake credentials.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Server configuration.
    pub config: Config,
    /// Upgraded connections still running.
    pub connections: ActiveConnections,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(broker: BrokerHandle, verifier: Arc<dyn TokenVerifier>, config: Config) -> Self {
        Self {
            broker,
            verifier,
            config,
            connections: ActiveConnections::new(),
        }
    }
}

/// Counts upgraded WebSocket connections.
///
/// Upgraded sockets outlive the HTTP server's own graceful shutdown, so the
/// server waits on this count before exiting.
#[derive(Clone)]
pub struct ActiveConnections(Arc<watch::Sender<usize>>);

impl ActiveConnections {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self(Arc::new(count))
    }

    /// Count a connection until the returned guard is dropped.
    #[must_use]
    pub fn track(&self) -> ActiveGuard {
        self.0.send_modify(|n| *n += 1);
        ActiveGuard(self.0.clone())
    }

    /// Number of connections currently tracked.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.0.borrow()
    }

    /// Wait up to `deadline` for every connection to finish.
    ///
    /// Returns `false` if some were still running at the deadline.
    pub async fn drained(&self, deadline: Duration) -> bool {
        let mut count = self.0.subscribe();
        timeout(deadline, count.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|waited| waited.is_ok())
    }
}

impl Default for ActiveConnections {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one connection counted in [`ActiveConnections`].
pub struct ActiveGuard(Arc<watch::Sender<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/conversations/:conversation_id/messages", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let verifier = build_verifier(&config)?;
    let collaborators = build_collaborators(&config)?;
    let (broker, broker_task) = Broker::spawn(config.broker_config(), collaborators);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(broker.clone(), verifier, config.clone()));
    let connections = state.connections.clone();
    let app = app(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let draining = broker.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received; draining broker");
            draining.shutdown().await;
        })
        .await?;

    broker_task.await.context("Broker task failed")?;

    // The broker has closed every mailbox; let connections send their close frames
    let connection = config.connection_config();
    if !connections
        .drained(connection.write_timeout + connection.close_grace)
        .await
    {
        warn!(
            remaining = connections.count(),
            "Connections still open at exit"
        );
    }
    info!("Parley server stopped");
    Ok(())
}

fn build_verifier(config: &Config) -> Result<Arc<dyn TokenVerifier>> {
    let secret = config
        .auth
        .jwt_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .context("auth.jwt_secret must be set (PARLEY_AUTH__JWT_SECRET)")?;

    let mut verifier = JwtVerifier::new(secret.as_bytes());
    if let Some(issuer) = &config.auth.issuer {
        verifier = verifier.with_issuer(issuer);
    }
    if let Some(audience) = &config.auth.audience {
        verifier = verifier.with_audience(audience);
    }
    Ok(Arc::new(verifier))
}

fn build_collaborators(config: &Config) -> Result<Collaborators> {
    let persistence: Arc<dyn PersistenceSink> = match &config.persistence.endpoint {
        Some(endpoint) => {
            let webhook = WebhookCollaborator::new(
                endpoint.clone(),
                Duration::from_millis(config.persistence.timeout_ms),
            )?;
            info!(endpoint = %webhook.endpoint(), "Persisting messages via webhook");
            Arc::new(webhook)
        }
        None => Arc::new(NoopCollaborator),
    };

    let fanout: Arc<dyn Fanout> = match &config.fanout.endpoint {
        Some(endpoint) => {
            let webhook = WebhookCollaborator::new(
                endpoint.clone(),
                Duration::from_millis(config.fanout.timeout_ms),
            )?;
            info!(endpoint = %webhook.endpoint(), "Fanning out messages via webhook");
            Arc::new(webhook)
        }
        None => Arc::new(NoopCollaborator),
    };

    Ok(Collaborators::new(persistence, fanout))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.broker.stats().await {
        Some(stats) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": PROTOCOL_VERSION.to_string(),
            "rooms": stats.rooms,
            "connections": stats.connections,
            "published": stats.published,
            "evicted": stats.evicted,
        }))
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "shutting_down",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
            .into_response(),
    }
}

fn reject(request: &HandshakeRequest, e: HandshakeError) -> Response {
    warn!(
        conversation = %request.conversation_id,
        user = %request.user_id,
        reason = e.reason(),
        error = %e,
        "Handshake rejected"
    );
    metrics::record_auth_failure(e.reason());
    e.into_response()
}

/// WebSocket upgrade handler.
///
/// The upgrade only proceeds once the credential has been verified and
/// names the declared principal.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    let request = HandshakeRequest::from_parts(query, &headers);
    let principal = match auth::authenticate(
        state.verifier.as_ref(),
        &request,
        state.config.handshake_timeout(),
    )
    .await
    {
        Ok(principal) => principal,
        Err(e) => return reject(&request, e),
    };

    let options = state.config.ws_options();
    let conversation_id = request.conversation_id;
    ws.max_message_size(options.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, conversation_id, principal.id))
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    conversation_id: String,
    principal_id: String,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    let _active = state.connections.track();

    let (source, sink) = websocket::split(socket, state.config.ws_options());
    let connection = Connection::new(conversation_id, principal_id);

    debug!(
        connection = %connection.id(),
        conversation = %connection.conversation_id(),
        principal = %connection.principal_id(),
        "WebSocket connected"
    );

    let reason = connection
        .run(&state.broker, source, sink, &state.config.connection_config())
        .await;

    debug!(reason = %reason, "WebSocket disconnected");
}

/// Body of a publish request.
#[derive(Debug, Deserialize)]
struct PublishRequest {
    content: String,
}

/// Publish a message without holding a connection.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Response {
    let principal = match auth::authenticate_bearer(
        state.verifier.as_ref(),
        &headers,
        state.config.handshake_timeout(),
    )
    .await
    {
        Ok(principal) => principal,
        Err(e) => {
            warn!(conversation = %conversation_id, reason = e.reason(), "Publish rejected");
            metrics::record_auth_failure(e.reason());
            return e.into_response();
        }
    };

    if let Err(e) = validate_conversation_id(&conversation_id) {
        return bad_request(e.to_string());
    }
    let content = match InboundFrame::new(body.content).into_content(state.config.limits.max_message_size) {
        Ok(content) => content,
        Err(e) => return bad_request(e.to_string()),
    };

    let message = Message::new(conversation_id.as_str(), principal.id, content);
    let id = message.id;
    state.broker.publish(message);

    debug!(conversation = %conversation_id, message_id = id, "Published via HTTP");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "conversationId": conversation_id })),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "invalid_request", "message": message })),
    )
        .into_response()
}
