//! Byte decoding and NDJSON framing.
//!
//! `Utf8ChunkDecoder` turns arbitrary byte chunks into text without ever
//! splitting a character, `FrameSplitter` turns that text into line frames,
//! and `FrameCodec` glues both into a `tokio_util` decoder so a response body
//! can be read with `FramedRead`.

use crate::constants::MAX_FRAME_BYTES;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes every complete character of `pending + chunk`.
    ///
    /// An incomplete trailing sequence is held back for the next call; an
    /// invalid one becomes U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            tracing::debug!("[DECODER] Replacing {} invalid byte(s)", bad);
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes a sequence that never completed. Only meaningful at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Splits decoded text on line feeds, keeping the incomplete last line.
#[derive(Debug)]
pub struct FrameSplitter {
    buffer: String,
    max_len: usize,
    discarding: bool,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl FrameSplitter {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: String::new(),
            max_len,
            discarding: false,
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut frames = Vec::new();
        let mut remaining = text;

        while let Some(idx) = remaining.find('\n') {
            let head = &remaining[..idx];
            remaining = &remaining[idx + 1..];

            if self.discarding {
                // the over-long frame ends here
                self.discarding = false;
                self.buffer.clear();
                continue;
            }

            self.buffer.push_str(head);
            let line = std::mem::take(&mut self.buffer);
            if line.len() > self.max_len {
                tracing::warn!(
                    "[DECODER] Dropping frame of {} bytes (limit {})",
                    line.len(),
                    self.max_len
                );
                continue;
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                frames.push(trimmed.to_string());
            }
        }

        if !self.discarding {
            self.buffer.push_str(remaining);
            if self.buffer.len() > self.max_len {
                tracing::warn!(
                    "[DECODER] Frame exceeded {} bytes without a delimiter; discarding until next line",
                    self.max_len
                );
                self.buffer.clear();
                self.discarding = true;
            }
        }

        frames
    }

    /// End-of-stream flush of the last unterminated frame.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// `Decoder` yielding one candidate JSON frame per item.
#[derive(Debug, Default)]
pub struct FrameCodec {
    bytes: Utf8ChunkDecoder,
    splitter: FrameSplitter,
    ready: VecDeque<String>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_len: usize) -> Self {
        Self {
            bytes: Utf8ChunkDecoder::new(),
            splitter: FrameSplitter::new(max_len),
            ready: VecDeque::new(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        if self.ready.is_empty() && !src.is_empty() {
            let chunk = src.split();
            let text = self.bytes.decode(&chunk);
            self.ready.extend(self.splitter.push(&text));
        }
        Ok(self.ready.pop_front())
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<String>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        let tail = self.bytes.finish();
        if !tail.is_empty() {
            self.ready.extend(self.splitter.push(&tail));
        }
        if let Some(last) = self.splitter.finish() {
            self.ready.push_back(last);
        }
        Ok(self.ready.pop_front())
    }
}

/// Wraps a response body into a stream of candidate frames.
pub fn frame_stream<S, E>(
    body: S,
    max_frame_len: usize,
) -> impl Stream<Item = std::io::Result<String>> + Unpin
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes_stream = body.map(|r| r.map_err(std::io::Error::other));
    FramedRead::new(
        StreamReader::new(bytes_stream),
        FrameCodec::with_max_frame_len(max_frame_len),
    )
}
