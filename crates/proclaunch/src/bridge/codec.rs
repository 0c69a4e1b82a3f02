//! Length-prefixed JSON framing for the helper connection.
//!
//! One frame is a 4-byte big-endian length followed by one JSON message.
//! Decode failures are classified so a broken stream (bad bytes from the
//! helper) can be told apart from a broken socket.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound for a single frame, enforced in both directions. Output chunks
/// and stdin writes are split far below this, so a larger length prefix means
/// the stream is corrupted.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {MAX_FRAME_LENGTH} bytes")]
    Oversized,
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// The peer sent bytes that are not a valid frame. The connection itself
    /// may still be fine, but the stream cannot be resynchronized.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _message: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        // The framing layer only fails on a length prefix over the cap.
        let frame = match self.frames.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::debug!(error = %e, buffered = src.len(), "Rejecting frame header");
                return Err(CodecError::Oversized);
            }
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(CodecError::Malformed)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&item).map_err(CodecError::Malformed)?;
        if body.len() > MAX_FRAME_LENGTH {
            tracing::error!(frame_bytes = body.len(), "Refusing to encode oversized frame");
            return Err(CodecError::Oversized);
        }
        tracing::trace!(frame_bytes = body.len(), "Encoding frame");
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
