//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat delivery service.
//!
//! Clients speak to the server over a single WebSocket bound to one
//! conversation. The protocol is deliberately small:
//!
//! - `InboundFrame` - the only client-to-server frame, carrying message content
//! - `ServerFrame::Connected` - sent once the broker has admitted the connection
//! - `ServerFrame::Message` - one delivered chat message
//!
//! Frames travel either as JSON text frames or as length-prefixed
//! MessagePack binary frames.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, InboundFrame};
//!
//! let frame = InboundFrame::new("hello");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: InboundFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_json, encode, encode_json, Encoding, ProtocolError};
pub use frames::{InboundFrame, MessageFrame, ServerFrame};
pub use version::{Version, PROTOCOL_VERSION};
