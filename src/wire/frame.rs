//! Message framing without a length prefix.
//!
//! The protocol carries no length header and no delimiter, so a message is
//! complete exactly when the bytes received so far parse as one JSON
//! document. [`FrameReader`] accumulates chunks and tracks string and brace
//! state as bytes arrive, attempting a real parse only when the trimmed
//! buffer is a `{`…`}` span whose top-level object could have closed. The
//! scan only decides when to parse; the parser decides what is complete.
//! Failed parses per frame are capped at [`MAX_PARSE_ATTEMPTS`].
//!
//! [`read_frame`] drives a `FrameReader` from an async socket with an idle
//! timeout per chunk.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;

/// Default ceiling on the size of one message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Size of each socket read.
const READ_CHUNK_SIZE: usize = 8192;

/// Failed parse attempts allowed per frame before deferring to the final
/// parse on close or timeout.
pub const MAX_PARSE_ATTEMPTS: usize = 32;

/// Accumulates byte chunks until they form one JSON document.
///
/// Each byte is scanned once to track string and nesting state, so a full
/// parse is only attempted when the top-level object could have closed.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    limit: usize,
    depth: isize,
    in_string: bool,
    escaped: bool,
    attempts: usize,
}

impl FrameReader {
    /// Creates a reader that rejects messages longer than `limit` bytes.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            depth: 0,
            in_string: false,
            escaped: false,
            attempts: 0,
        }
    }

    /// Number of full parses that failed so far.
    #[must_use]
    pub const fn parse_attempts(&self) -> usize {
        self.attempts
    }

    /// Number of bytes accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends a chunk and checks whether a complete object has arrived.
    ///
    /// Returns `Ok(None)` while the message is still streaming. After
    /// [`MAX_PARSE_ATTEMPTS`] failed parses the frame is only resolved by
    /// [`Self::finish_closed`] or [`Self::finish_timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] once the buffer exceeds the limit; no
    /// parse is attempted on an oversized buffer.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Value>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.limit {
            return Err(FrameError::TooLarge { limit: self.limit });
        }
        self.scan(chunk);

        if self.in_string || self.depth != 0 || self.attempts >= MAX_PARSE_ATTEMPTS {
            return Ok(None);
        }

        let candidate = trim_whitespace(&self.buffer);
        if candidate.first() != Some(&b'{') || candidate.last() != Some(&b'}') {
            return Ok(None);
        }

        match serde_json::from_slice(candidate) {
            Ok(document) => Ok(Some(document)),
            Err(_) => {
                self.attempts += 1;
                if self.attempts == MAX_PARSE_ATTEMPTS {
                    tracing::debug!(
                        bytes = self.buffer.len(),
                        "parse attempt limit reached, waiting for close or timeout"
                    );
                }
                Ok(None)
            }
        }
    }

    /// Updates string and nesting state with newly received bytes.
    fn scan(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
            } else {
                match byte {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => self.depth -= 1,
                    _ => {}
                }
            }
        }
    }

    /// Resolves the frame after the peer closed the connection.
    ///
    /// Whatever was received gets one final parse; any JSON value is
    /// accepted here so the dispatcher can report a structural error for
    /// non-objects.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Closed`] if nothing was received, or
    /// [`FrameError::Malformed`] if the bytes are not valid JSON.
    pub fn finish_closed(self) -> Result<Value, FrameError> {
        if self.buffer.is_empty() {
            return Err(FrameError::Closed);
        }
        serde_json::from_slice(&self.buffer).map_err(|e| FrameError::Malformed {
            received: self.buffer.len(),
            reason: e.to_string(),
        })
    }

    /// Resolves the frame after the idle timeout elapsed.
    ///
    /// A message that arrived just before the deadline is still returned.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Timeout`] if the received bytes do not parse.
    pub fn finish_timeout(self, timeout: Duration) -> Result<Value, FrameError> {
        if !self.buffer.is_empty() {
            if let Ok(document) = serde_json::from_slice(&self.buffer) {
                return Ok(document);
            }
        }
        Err(FrameError::Timeout {
            timeout,
            received: self.buffer.len(),
        })
    }
}

/// Reads exactly one JSON document from `reader`.
///
/// Each read waits at most `idle_timeout`. Any bytes that arrive after the
/// document in its final chunk are discarded.
///
/// # Errors
///
/// Returns a [`FrameError`] classifying why no document was produced.
pub async fn read_frame<R>(
    reader: &mut R,
    idle_timeout: Duration,
    limit: usize,
) -> Result<Value, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = FrameReader::new(limit);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = match tokio::time::timeout(idle_timeout, reader.read(&mut chunk)).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => return Err(FrameError::Io(e)),
            Err(_) => return frame.finish_timeout(idle_timeout),
        };

        if read == 0 {
            return frame.finish_closed();
        }

        if let Some(document) = frame.push(&chunk[..read])? {
            tracing::trace!(bytes = frame.len(), "frame complete");
            return Ok(document);
        }
    }
}

/// Strips ASCII whitespace from both ends of a byte slice.
fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
