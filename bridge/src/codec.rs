//! Line-delimited JSON framing for the analyzer protocol.
//!
//! The analyzer reads and writes one JSON document per line on its
//! stdin/stdout. This module provides [`FrameReader`] and [`FrameWriter`]
//! for async reading and writing of those frames.
//!
//! A malformed line is reported as [`FrameEvent::Malformed`] and the reader
//! stays usable; only I/O failures and EOF in the middle of a frame end the
//! stream.

use anyhow::{Context, Result, bail};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::ProtocolError;

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One decoded line.
#[derive(Debug)]
pub enum FrameEvent {
    Message(serde_json::Value),
    Malformed(ProtocolError),
}

/// Reads newline-terminated JSON frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns `Err` on I/O failure or EOF inside a partial frame.
    pub async fn read_frame(&mut self) -> Result<Option<FrameEvent>> {
        loop {
            self.line.clear();
            let limit = MAX_FRAME_BYTES as u64 + 1;
            let bytes_read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await
                .context("reading frame")?;

            if bytes_read == 0 {
                return Ok(None);
            }

            if self.line.last() != Some(&b'\n') {
                if self.line.len() > MAX_FRAME_BYTES {
                    self.discard_rest_of_line().await?;
                    return Ok(Some(FrameEvent::Malformed(ProtocolError::new(format!(
                        "frame exceeds maximum of {MAX_FRAME_BYTES} bytes"
                    )))));
                }
                bail!("unexpected EOF inside frame ({} bytes buffered)", self.line.len());
            }

            let body = self.line.trim_ascii();
            if body.is_empty() {
                continue;
            }

            return Ok(Some(decode(body)));
        }
    }

    /// Skip input up to and including the next newline.
    async fn discard_rest_of_line(&mut self) -> Result<()> {
        loop {
            let buf = self
                .reader
                .fill_buf()
                .await
                .context("discarding oversized frame")?;
            if buf.is_empty() {
                return Ok(());
            }
            let (consumed, done) = match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), false),
            };
            self.reader.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }
}

fn decode(body: &[u8]) -> FrameEvent {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) if value.is_object() => FrameEvent::Message(value),
        Ok(_) => FrameEvent::Malformed(
            ProtocolError::new("frame is not a JSON object")
                .with_excerpt(&String::from_utf8_lossy(body)),
        ),
        Err(e) => FrameEvent::Malformed(
            ProtocolError::new(format!("invalid JSON frame: {e}"))
                .with_excerpt(&String::from_utf8_lossy(body)),
        ),
    }
}

/// Writes newline-terminated JSON frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame and flush it.
    ///
    /// `serde_json` escapes control characters inside strings, so the
    /// serialized body never contains a raw newline.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let mut body = serde_json::to_vec(msg).context("serializing frame")?;
        body.push(b'\n');

        self.writer
            .write_all(&body)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;

        Ok(())
    }

    /// Flush and close the underlying writer (closes the analyzer's stdin).
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing writer")
    }
}
