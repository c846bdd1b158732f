//! Base-protocol framing: a `Content-Length` header block, a blank line,
//! then exactly that many bytes of JSON.
//!
//! [`FrameDecoder`] is an incremental, buffer-based parser: bytes are fed in
//! whatever chunks the pipe delivers and zero or more complete messages come
//! out. [`FrameWriter`] frames outgoing messages onto an async writer.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Frames larger than this (4 MiB) are skipped, never buffered.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// A header block with no blank line within this many bytes is garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH_MARKER: &[u8] = b"content-length";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized(usize),
    #[error("header block exceeds {MAX_HEADER_BYTES} bytes, skipped {0} bytes")]
    HeaderTooLong(usize),
    #[error("parsing JSON-RPC frame: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

/// Incremental decoder for `Content-Length` framed JSON-RPC messages.
///
/// Bytes that do not yet form a complete frame stay buffered until the next
/// [`FrameDecoder::feed`]. A malformed frame is dropped without disturbing
/// the frames around it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Body bytes of an oversized frame still to be skipped as they arrive.
    discard: usize,
    /// Prefix of `buffer` already searched for the header separator.
    scanned: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every message that is now complete.
    ///
    /// Malformed frames are logged and skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(result) = self.next_frame() {
            match result {
                Ok(value) => frames.push(value),
                Err(e) => tracing::warn!("Dropping malformed LSP frame: {e}"),
            }
        }
        frames
    }

    /// Append raw bytes without extracting frames.
    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.discard > 0 {
            let skipped = self.discard.min(bytes.len());
            self.discard -= skipped;
            bytes = &bytes[skipped..];
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract the next frame from the buffer.
    ///
    /// Returns `None` when more data is needed. A header block that cannot be
    /// parsed is consumed and reported as an error so the caller can carry on
    /// with the following frame. A header block that runs past
    /// `MAX_HEADER_BYTES` is skipped up to the next `Content-Length`.
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        let Some(header_end) = self.find_separator() else {
            if self.buffer.len() >= MAX_HEADER_BYTES + HEADER_SEPARATOR.len() {
                let skipped = resync_offset(&self.buffer);
                self.consume(skipped);
                return Some(Err(FrameError::HeaderTooLong(skipped)));
            }
            return None;
        };
        let body_start = header_end + HEADER_SEPARATOR.len();

        let content_length = match parse_content_length(&self.buffer[..header_end]) {
            Ok(len) => len,
            Err(e) => {
                self.consume(body_start);
                return Some(Err(e));
            }
        };

        if content_length > MAX_FRAME_BYTES {
            let buffered = content_length.min(self.buffer.len() - body_start);
            self.consume(body_start + buffered);
            self.discard = content_length - buffered;
            return Some(Err(FrameError::Oversized(content_length)));
        }

        let frame_end = body_start + content_length;
        if self.buffer.len() < frame_end {
            return None;
        }

        let result = serde_json::from_slice(&self.buffer[body_start..frame_end])
            .map_err(FrameError::InvalidJson);
        self.consume(frame_end);
        Some(result)
    }

    /// Search for the separator within the header window, resuming where the
    /// previous search stopped.
    fn find_separator(&mut self) -> Option<usize> {
        let end = self
            .buffer
            .len()
            .min(MAX_HEADER_BYTES + HEADER_SEPARATOR.len());
        let start = self
            .scanned
            .saturating_sub(HEADER_SEPARATOR.len() - 1)
            .min(end);
        let found = self.buffer[start..end]
            .windows(HEADER_SEPARATOR.len())
            .position(|window| window == HEADER_SEPARATOR)
            .map(|i| start + i);
        self.scanned = found.unwrap_or(end);
        found
    }

    fn consume(&mut self, n: usize) {
        self.buffer.drain(..n);
        self.scanned = 0;
    }

    /// Number of bytes held waiting for the rest of a frame.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Bytes to drop from a non-empty buffer to reach the next plausible header
/// start. Always at least one, so a garbage header cannot stall the decoder.
fn resync_offset(buffer: &[u8]) -> usize {
    let marker = CONTENT_LENGTH_MARKER;
    if let Some(i) = buffer[1..]
        .windows(marker.len())
        .position(|window| window.eq_ignore_ascii_case(marker))
    {
        return i + 1;
    }
    // Keep a trailing partial marker; the rest of it may still be in flight.
    let keep = (1..marker.len())
        .rev()
        .find(|&n| {
            n < buffer.len() && buffer[buffer.len() - n..].eq_ignore_ascii_case(&marker[..n])
        })
        .unwrap_or(0);
    buffer.len() - keep
}

fn parse_content_length(header: &[u8]) -> Result<usize, FrameError> {
    let header = String::from_utf8_lossy(header);
    for line in header.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FrameError::MissingContentLength)
}

/// Serialize `msg` and prepend its `Content-Length` header.
///
/// The length counts UTF-8 bytes, not characters.
pub fn encode_frame(msg: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Frames outgoing messages onto the server's stdin.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one framed message and flush.
    pub async fn write_frame(&mut self, msg: &Value) -> std::io::Result<()> {
        let frame = encode_frame(msg)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
