//! # parley-core
//!
//! Room membership, message fan-out, and connection lifecycle for the
//! Parley chat delivery service.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Rooms keyed by conversation id and their members
//! - **Broker** - The single event loop that owns the registry
//! - **Connection** - Read and write pumps bridging a transport to the broker
//! - **Collaborators** - Persistence and cross-process fan-out hooks
//! - **Message** - The accepted chat message
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  events  ┌─────────────┐  mailbox  ┌─────────────┐
//! │  Connection │─────────▶│   Broker    │──────────▶│  Connection │
//! └─────────────┘          └─────────────┘           └─────────────┘
//!                                 │
//!                                 ▼
//!                          ┌─────────────┐
//!                          │Collaborators│
//!                          └─────────────┘
//! ```

pub mod broker;
pub mod collaborator;
pub mod connection;
pub mod message;
pub mod metrics;
pub mod registry;

pub use broker::{Broker, BrokerConfig, BrokerHandle, BrokerStats, JoinTicket};
pub use collaborator::{CollaboratorError, Collaborators, Fanout, NoopCollaborator, PersistenceSink};
pub use connection::{Connection, ConnectionConfig, ConnectionState, DisconnectReason};
pub use message::{ConversationId, Message, MessageId, PrincipalId};
pub use parley_transport::ConnectionId;
pub use registry::{DeliveryReport, JoinOutcome, Member, RoomRegistry};
