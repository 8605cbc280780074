//! Incremental frame decoder

use crate::mux::{Frame, FrameKind, StreamId};
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Codec errors. Any of these means the byte stream can no longer be trusted.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Invalid stream id {stream_id} for {kind:?} frame")]
    InvalidStreamId { kind: FrameKind, stream_id: StreamId },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Tunnel frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Decode a frame from the front of `buf`
    ///
    /// Format: [kind: u8][stream_id: u32][length: u32][payload]
    ///
    /// Returns Ok(Some(frame)) if a complete frame was decoded,
    /// Ok(None) if more data is needed (the buffer is left untouched),
    /// Err if the stream is corrupt
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let kind = FrameKind::from_u8(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

        // Reject before buffering the payload.
        if length > crate::MAX_PAYLOAD_SIZE {
            return Err(CodecError::FrameTooLarge(length as usize));
        }
        kind.check_stream_id(stream_id)?;

        let length = length as usize;
        if buf.len() < Frame::HEADER_SIZE + length {
            buf.reserve(Frame::HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Frame::HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Frame::new(kind, stream_id, payload)))
    }

    /// Try to decode multiple frames from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();

        while let Some(frame) = Self::decode(buf)? {
            frames.push(frame);
        }

        Ok(frames)
    }
}
