//! Multiplexing primitives for tunnel protocol

use crate::codec::CodecError;
use crate::messages::{CloseReason, Message, Protocol, RelayErrorCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Stream identifier
pub type StreamId = u32;

/// Frame kinds. Control kinds travel on stream 0, data kinds on a non-zero stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Register = 0x01,
    Registered = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Error = 0x05,
    Open = 0x10,
    Data = 0x11,
    Close = 0x12,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(FrameKind::Register),
            0x02 => Ok(FrameKind::Registered),
            0x03 => Ok(FrameKind::Ping),
            0x04 => Ok(FrameKind::Pong),
            0x05 => Ok(FrameKind::Error),
            0x10 => Ok(FrameKind::Open),
            0x11 => Ok(FrameKind::Data),
            0x12 => Ok(FrameKind::Close),
            _ => Err(CodecError::UnknownKind(value)),
        }
    }

    /// Control frames are addressed to the session, not to a stream
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            FrameKind::Register
                | FrameKind::Registered
                | FrameKind::Ping
                | FrameKind::Pong
                | FrameKind::Error
        )
    }

    /// Check that a stream ID is legal for this kind
    pub fn check_stream_id(&self, stream_id: StreamId) -> Result<(), CodecError> {
        let ok = if self.is_control() {
            stream_id == crate::CONTROL_STREAM_ID
        } else {
            stream_id != crate::CONTROL_STREAM_ID
        };
        if ok {
            Ok(())
        } else {
            Err(CodecError::InvalidStreamId {
                kind: *self,
                stream_id,
            })
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: kind (1) + stream_id (4) + length (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(kind: FrameKind, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    fn control(kind: FrameKind, payload: Bytes) -> Self {
        Self::new(kind, crate::CONTROL_STREAM_ID, payload)
    }

    /// Ask the relay for a tunnel. An empty subdomain lets the relay pick
    /// one; a TCP tunnel may also ask for a public port.
    ///
    /// Payload: [protocol: u8][remote_port: u16, 0 = none][subdomain]
    pub fn register(protocol: Protocol, remote_port: Option<u16>, subdomain: &str) -> Self {
        let mut buf = BytesMut::with_capacity(3 + subdomain.len());
        buf.put_u8(protocol.as_u8());
        buf.put_u16(remote_port.unwrap_or(0));
        buf.put_slice(subdomain.as_bytes());
        Self::control(FrameKind::Register, buf.freeze())
    }

    /// Payload: [remote_port: u16, 0 = none][subdomain]
    pub fn registered(subdomain: &str, remote_port: Option<u16>) -> Self {
        let mut buf = BytesMut::with_capacity(2 + subdomain.len());
        buf.put_u16(remote_port.unwrap_or(0));
        buf.put_slice(subdomain.as_bytes());
        Self::control(FrameKind::Registered, buf.freeze())
    }

    pub fn ping(payload: Bytes) -> Self {
        Self::control(FrameKind::Ping, payload)
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::control(FrameKind::Pong, payload)
    }

    pub fn error(code: RelayErrorCode, message: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + message.len());
        buf.put_u16(code.as_u16());
        buf.put_slice(message.as_bytes());
        Self::control(FrameKind::Error, buf.freeze())
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(FrameKind::Open, stream_id, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, stream_id, payload)
    }

    pub fn close(stream_id: StreamId, reason: CloseReason, detail: &str) -> Self {
        let mut buf = BytesMut::with_capacity(1 + detail.len());
        buf.put_u8(reason.as_u8());
        buf.put_slice(detail.as_bytes());
        Self::new(FrameKind::Close, stream_id, buf.freeze())
    }

    /// Encoded size of this frame on the wire
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_PAYLOAD_SIZE as usize {
            return Err(CodecError::FrameTooLarge(payload_len));
        }
        self.kind.check_stream_id(self.stream_id)?;

        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.stream_id);
        dst.put_u32(payload_len as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Interpret the payload according to the frame kind
    pub fn into_message(self) -> Result<Message, CodecError> {
        let stream_id = self.stream_id;
        let mut payload = self.payload;

        let msg = match self.kind {
            FrameKind::Register => {
                if payload.len() < 3 {
                    return Err(CodecError::InvalidPayload(
                        "register frame shorter than its header".to_string(),
                    ));
                }
                let protocol = Protocol::from_u8(payload.get_u8()).ok_or_else(|| {
                    CodecError::InvalidPayload("unknown tunnel protocol".to_string())
                })?;
                let remote_port = port(payload.get_u16());
                Message::Register {
                    protocol,
                    remote_port,
                    subdomain: utf8(payload)?,
                }
            }
            FrameKind::Registered => {
                if payload.len() < 2 {
                    return Err(CodecError::InvalidPayload(
                        "registered frame shorter than its port".to_string(),
                    ));
                }
                let remote_port = port(payload.get_u16());
                Message::Registered {
                    subdomain: utf8(payload)?,
                    remote_port,
                }
            }
            FrameKind::Ping => Message::Ping { payload },
            FrameKind::Pong => Message::Pong { payload },
            FrameKind::Error => {
                if payload.len() < 2 {
                    return Err(CodecError::InvalidPayload(
                        "error frame shorter than its code".to_string(),
                    ));
                }
                let code = RelayErrorCode::from_u16(payload.get_u16());
                Message::Error {
                    code,
                    message: utf8(payload)?,
                }
            }
            FrameKind::Open => Message::Open { stream_id },
            FrameKind::Data => Message::Data { stream_id, payload },
            FrameKind::Close => {
                // A bare close carries no reason byte and means a normal close.
                let reason = if payload.has_remaining() {
                    CloseReason::from_u8(payload.get_u8())
                } else {
                    CloseReason::Normal
                };
                Message::Close {
                    stream_id,
                    reason,
                    detail: utf8(payload)?,
                }
            }
        };

        Ok(msg)
    }
}

fn port(value: u16) -> Option<u16> {
    (value != 0).then_some(value)
}

fn utf8(payload: Bytes) -> Result<String, CodecError> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| CodecError::InvalidPayload(format!("invalid utf-8: {}", e)))
}
