//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum `WebSocket` into a [`FrameSource`] and a
//! [`FrameSink`]. Text frames carry JSON, binary frames carry
//! length-prefixed MessagePack.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, Encoding, InboundFrame, ServerFrame};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::traits::{FrameSink, FrameSource, TransportError};

/// WebSocket adapter options.
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Encoding used for outbound frames.
    pub encoding: Encoding,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Read deadline; a peer silent for longer than this is considered gone.
    pub read_timeout: Option<Duration>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            max_message_size: 64 * 1024, // 64 KB
            read_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Split a WebSocket into its read and write halves.
#[must_use]
pub fn split(socket: WebSocket, options: WsOptions) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    let source = WsSource {
        stream,
        read_buffer: BytesMut::with_capacity(4096),
        max_message_size: options.max_message_size,
        read_timeout: options.read_timeout,
    };
    let sink = WsSink {
        sink,
        encoding: options.encoding,
        open: true,
    };
    (source, sink)
}

/// The read half of a WebSocket session.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
    read_timeout: Option<Duration>,
}

impl WsSource {
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        let next = match self.read_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => self.stream.next().await,
        };

        match next {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                size, self.max_message_size
            );
            return Err(TransportError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
        // A previous binary message may have carried more than one frame
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            let Some(message) = self.next_message().await? else {
                debug!("WebSocket stream ended");
                return Ok(None);
            };

            match message {
                Message::Text(text) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Message::Binary(data) => {
                    self.check_size(self.read_buffer.len() + data.len())?;
                    self.read_buffer.extend_from_slice(&data);

                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                    // Need more data, continue reading
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Pings are answered by the protocol layer
                    trace!("Control frame received");
                }
                Message::Close(frame) => {
                    debug!(close = ?frame, "Received close frame");
                    return Ok(None);
                }
            }
        }
    }
}

/// The write half of a WebSocket session.
pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
    encoding: Encoding,
    open: bool,
}

impl WsSink {
    async fn send_message(&mut self, message: Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let message = match self.encoding {
            Encoding::Json => Message::Text(codec::encode_json(frame)?),
            Encoding::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
        };
        self.send_message(message).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }

        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        };
        let result = self.send_message(Message::Close(Some(frame))).await;
        self.open = false;
        result
    }
}
