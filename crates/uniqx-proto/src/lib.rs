//! Tunnel Protocol Definitions
//!
//! This crate defines the frame model and wire codec spoken between the
//! uniqx client and the public relay. Every message, control or data, travels
//! as a [`Frame`] over a single relay connection.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{CodecError, FrameCodec};
pub use messages::{CloseReason, Message, Protocol, RelayErrorCode};
pub use mux::{Frame, FrameKind, StreamId};

/// Maximum payload size carried by a single frame (1MiB)
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: StreamId = 0;
