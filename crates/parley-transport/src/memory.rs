//! In-process transport.
//!
//! [`pair`] returns a source/sink pair wired to a [`MemoryPeer`] that plays
//! the remote client: it feeds JSON text frames in and observes what the
//! server writes out. Used by tests and benchmarks.

use async_trait::async_trait;
use parley_protocol::{codec, InboundFrame, ServerFrame};
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, TransportError};

/// What the peer writes onto the wire.
#[derive(Debug)]
enum Wire {
    Text(String),
    Fault(String),
}

/// What the server wrote, as seen by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A server frame.
    Frame(ServerFrame),
    /// A keepalive ping.
    Ping,
    /// The closing handshake.
    Close,
}

/// Create a connected in-memory transport.
#[must_use]
pub fn pair() -> (MemorySource, MemorySink, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    (
        MemorySource { inbound: inbound_rx },
        MemorySink {
            outbound: outbound_tx,
            open: true,
        },
        MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        },
    )
}

/// The read half of an in-memory session.
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Wire>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        match self.inbound.recv().await {
            Some(Wire::Text(text)) => Ok(Some(codec::decode_json(&text)?)),
            Some(Wire::Fault(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

/// The write half of an in-memory session.
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<PeerEvent>,
    open: bool,
}

impl MemorySink {
    fn deliver(&self, event: PeerEvent) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .map_err(|_| TransportError::SendFailed("peer stopped reading".into()))
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        self.deliver(PeerEvent::Frame(frame.clone()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.deliver(PeerEvent::Ping)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        let result = self.deliver(PeerEvent::Close);
        self.open = false;
        result
    }
}

/// The remote end of an in-memory session.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Wire>>,
    outbound: mpsc::UnboundedReceiver<PeerEvent>,
}

impl MemoryPeer {
    /// Send a message with the given content.
    ///
    /// Returns `false` if the peer has already closed its side.
    pub fn send(&self, content: impl Into<String>) -> bool {
        let frame = InboundFrame::new(content);
        match codec::encode_json(&frame) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Send a raw text frame, which need not be valid.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Wire::Text(text.into()))
    }

    /// Make the next read on the server side fail.
    pub fn fail_read(&self, reason: impl Into<String>) -> bool {
        self.push(Wire::Fault(reason.into()))
    }

    /// Close the peer's writing side; the server reads a clean end of stream.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Stop reading; subsequent server writes fail like a vanished peer.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    /// Wait for the next thing the server wrote.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.outbound.recv().await
    }

    /// Wait for the next server frame, skipping keepalives.
    ///
    /// Returns `None` once the server has closed the session.
    pub async fn next_frame(&mut self) -> Option<ServerFrame> {
        loop {
            match self.outbound.recv().await? {
                PeerEvent::Frame(frame) => return Some(frame),
                PeerEvent::Ping => continue,
                PeerEvent::Close => return None,
            }
        }
    }

    /// Take whatever the server has written so far without waiting.
    pub fn try_next_event(&mut self) -> Option<PeerEvent> {
        self.outbound.try_recv().ok()
    }

    fn push(&self, wire: Wire) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|inbound| inbound.send(wire).is_ok())
    }
}
