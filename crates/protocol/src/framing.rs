//! Frame codec for JSON text frames and the output stream decoder.
//!
//! # Frame Format
//!
//! Each WebSocket text message carries exactly one JSON object. Frames larger
//! than the configured limit are rejected before parsing.
//!
//! # Output decoding
//!
//! Process output arrives as arbitrary byte chunks, which may split a
//! multi-byte UTF-8 sequence. [`Utf8StreamDecoder`] carries the incomplete
//! tail of one chunk over to the next so characters are never mangled at
//! chunk boundaries.

use crate::error::{ProtocolError, Result};
use crate::messages::{ClientMessage, ServerMessage};

/// Maximum accepted client frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encodes server frames and decodes client frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Size limit enforced by [`decode`](Self::decode).
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Parse one client frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if the text exceeds the limit, or
    /// `Deserialization` if it is not a recognised frame.
    pub fn decode(&self, text: &str) -> Result<ClientMessage> {
        if text.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize one server frame.
    pub fn encode(&self, message: &ServerMessage) -> Result<String> {
        serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Incremental UTF-8 decoder for process output.
///
/// Invalid sequences are replaced with U+FFFD; a sequence cut off at the end
/// of a chunk is held back until the next chunk completes it.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back from the previous chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decode a chunk, returning every complete character seen so far.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = &buf[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush any held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }
}
