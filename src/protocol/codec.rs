//! Protocol codec
//!
//! Framing for every message on the wire, in both directions.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬─────────────────────────────────────┐
//! │ Len (4)  │      bincode-encoded message        │
//! └──────────┴─────────────────────────────────────┘
//! ```
//!
//! The length is big-endian and covers the body only. Frames are
//! self-delimiting, so a stream of concatenated frames can be split back
//! up no matter how the transport chunks it.

use std::io::{Read, Write};

use bincode::Options;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MuxError, Result};

/// Header size: 4 bytes length
pub const HEADER_SIZE: usize = 4;

/// Default upper bound on a frame body (512 MB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 512 * 1024 * 1024;

/// Body encoding: fixed-width integers, and the body must fill the frame
fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a message into a complete frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body_len = body_options().serialized_size(message)? as usize;
    if body_len > u32::MAX as usize {
        return Err(MuxError::Serialization(format!(
            "Message too large to frame: {} bytes",
            body_len
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    body_options().serialize_into(&mut frame, message)?;

    Ok(frame)
}

/// Append an encoded frame to an existing buffer
pub fn encode_frame_into<T: Serialize>(buffer: &mut BytesMut, message: &T) -> Result<()> {
    let frame = encode_frame(message)?;
    buffer.extend_from_slice(&frame);
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Try to parse one frame at the start of `bytes`.
///
/// Returns `Ok(None)` when `bytes` holds only a prefix of a frame, or
/// `Ok(Some((message, consumed)))` on success.
pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_size: u32,
) -> Result<Option<(T, usize)>> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    if body_len > max_frame_size {
        return Err(MuxError::Decode(format!(
            "Frame too large: {} bytes (max {})",
            body_len, max_frame_size
        )));
    }

    let total_len = HEADER_SIZE + body_len as usize;
    if bytes.len() < total_len {
        return Ok(None);
    }

    let message = body_options()
        .deserialize(&bytes[HEADER_SIZE..total_len])
        .map_err(|e| MuxError::Decode(format!("Malformed frame body: {}", e)))?;

    Ok(Some((message, total_len)))
}

/// Incremental decoder holding the partial-read buffer of one stream
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes received but not yet forming a complete frame
    partial: BytesMut,

    max_frame_size: u32,

    /// Set after a fatal parse failure; the stream can no longer be framed
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            partial: BytesMut::new(),
            max_frame_size,
            poisoned: false,
        }
    }

    /// Resume from a previously returned partial buffer
    pub fn from_partial(partial: BytesMut, max_frame_size: u32) -> Self {
        Self {
            partial,
            max_frame_size,
            poisoned: false,
        }
    }

    /// Feed newly received bytes and return every frame now complete.
    ///
    /// A trailing incomplete frame stays buffered for the next call.
    pub fn feed<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Result<Vec<T>> {
        if self.poisoned {
            return Err(MuxError::Decode(
                "Decoder unusable after an earlier framing error".to_string(),
            ));
        }

        self.partial.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut position = 0;
        loop {
            match decode_frame(&self.partial[position..], self.max_frame_size) {
                Ok(Some((frame, consumed))) => {
                    frames.push(frame);
                    position += consumed;
                }
                Ok(None) => break,
                Err(e) => {
                    self.poisoned = true;
                    self.partial.clear();
                    return Err(e);
                }
            }
        }

        let _ = self.partial.split_to(position);
        Ok(frames)
    }

    /// Number of buffered bytes not yet forming a frame
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }

    /// Give the partial buffer back to the caller
    pub fn into_partial(self) -> BytesMut {
        self.partial
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless form of [`FrameDecoder::feed`]:
/// `(previous partial, new bytes) -> (frames, remaining partial)`
pub fn feed_frames<T: DeserializeOwned>(
    partial: BytesMut,
    bytes: &[u8],
    max_frame_size: u32,
) -> Result<(Vec<T>, BytesMut)> {
    let mut decoder = FrameDecoder::from_partial(partial, max_frame_size);
    let frames = decoder.feed(bytes)?;
    Ok((frames, decoder.into_partial()))
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read exactly one frame from a blocking stream
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, max_frame_size: u32) -> Result<T> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let body_len = u32::from_be_bytes(header);
    if body_len > max_frame_size {
        return Err(MuxError::Decode(format!(
            "Frame too large: {} bytes (max {})",
            body_len, max_frame_size
        )));
    }

    let mut body = vec![0u8; body_len as usize];
    if body_len > 0 {
        reader.read_exact(&mut body)?;
    }

    body_options()
        .deserialize(&body)
        .map_err(|e| MuxError::Decode(format!("Malformed frame body: {}", e)))
}

/// Write one frame to a blocking stream
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = encode_frame(message)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
