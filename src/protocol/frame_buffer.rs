//! Frame buffer for accumulating partial reads.
//!
//! Serial reads split packets at arbitrary points. The buffer collects bytes
//! and cuts out complete `START .. STOP` spans:
//! - Bytes before a START are line noise and are dropped
//! - A START inside an unfinished span restarts the span (the sender gave
//!   up on the previous packet)
//! - A span growing past the size limit is discarded
//!
//! Returned frames still carry their delimiters and escaping; pass them to
//! [`unwrap`](super::unwrap).
//!
//! # Example
//!
//! ```
//! use pcom_link::protocol::{wrap, FrameBuffer};
//!
//! let packet = wrap(b"hello", 1, true).unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&packet[..3]).is_empty());
//! let frames = buffer.push(&packet[3..]);
//! assert_eq!(frames, vec![packet]);
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use super::wire_format::{HEADER_SIZE, START_BYTE, STOP_BYTE};

/// Largest unescaped payload the link expects by default.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 4096;

/// Default limit on a raw frame: every body byte escaped, plus delimiters.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * (HEADER_SIZE + DEFAULT_MAX_PAYLOAD_SIZE) + 2;

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Bytes of the current, unfinished frame (always starts with START).
    buffer: BytesMut,
    /// Maximum raw frame length, delimiters included.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom raw frame limit.
    pub fn with_max_frame(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_size.min(64 * 1024)),
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Never fails: anything that cannot be part of a frame is dropped and
    /// logged, and the sender's retry recovers the loss.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(stop) = self.buffer.iter().position(|&b| b == STOP_BYTE) {
            let span = self.buffer.split_to(stop + 1);
            match span.iter().rposition(|&b| b == START_BYTE) {
                Some(start) => {
                    if start > 0 {
                        warn!(dropped = start, "Discarding bytes before frame start");
                    }
                    let frame = span.freeze().slice(start..);
                    if frame.len() > self.max_frame_size {
                        warn!(
                            len = frame.len(),
                            max = self.max_frame_size,
                            "Discarding oversized frame"
                        );
                        continue;
                    }
                    frames.push(frame);
                }
                None => {
                    warn!(dropped = span.len(), "Discarding bytes without frame start");
                }
            }
        }

        self.trim_pending();
        frames
    }

    /// Keep only the unfinished span that begins at the most recent START.
    fn trim_pending(&mut self) {
        match self.buffer.iter().rposition(|&b| b == START_BYTE) {
            Some(0) => {}
            Some(start) => {
                warn!(dropped = start, "Discarding incomplete frame");
                self.buffer.advance(start);
            }
            None if self.buffer.is_empty() => {}
            None => {
                warn!(dropped = self.buffer.len(), "Discarding bytes without frame start");
                self.buffer.clear();
            }
        }

        if self.buffer.len() > self.max_frame_size {
            warn!(
                len = self.buffer.len(),
                max = self.max_frame_size,
                "Discarding frame that exceeds the size limit"
            );
            self.buffer.clear();
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
