//! # parley-transport
//!
//! Transport abstraction layer for the Parley chat delivery service.
//!
//! A live session is split into two halves so that the inbound and
//! outbound pumps can run as independent tasks:
//!
//! - [`FrameSource`] - the read half, yielding decoded client frames
//! - [`FrameSink`] - the write half, sending server frames
//!
//! Implementations:
//!
//! - **WebSocket** - an adapter over axum's upgraded `WebSocket`
//! - **Memory** - an in-process pair driven by a [`memory::MemoryPeer`]
//!
//! ```rust,ignore
//! use parley_transport::{FrameSource, FrameSink};
//!
//! async fn echo(mut source: impl FrameSource, mut sink: impl FrameSink) {
//!     while let Ok(Some(frame)) = source.recv().await {
//!         // Process frame
//!     }
//!     let _ = sink.close().await;
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WsOptions, WsSink, WsSource};
