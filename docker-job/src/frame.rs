//! Multiplexed log stream framing.
//!
//! Containers without a TTY deliver stdout and stderr over one connection.
//! Every frame starts with an 8 byte header: the stream type in byte 0,
//! three padding bytes, then the payload length as a big-endian u32.

use std::borrow::Cow;
use std::io::{self, Write};

use crate::error::FrameError;

pub const HEADER_LEN: usize = 8;
const STREAM_TYPE_OFFSET: usize = 0;
const FRAME_SIZE_OFFSET: usize = 4;

/// Destination stream of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Map a header tag to a stream. stdin (0) is echoed to stdout.
    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0 | 1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(FrameError::UnknownStream(other)),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

impl LogFrame {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

fn payload_len(header: &[u8]) -> usize {
    let mut size = [0u8; 4];
    size.copy_from_slice(&header[FRAME_SIZE_OFFSET..HEADER_LEN]);
    u32::from_be_bytes(size) as usize
}

/// Decode the frame at the start of `chunk`.
///
/// Bytes after the frame are ignored; use [`FrameReader`] for streams where
/// frames and transport chunks do not line up.
pub fn decode_frame(chunk: &[u8]) -> Result<LogFrame, FrameError> {
    if chunk.len() < HEADER_LEN {
        return Err(FrameError::TruncatedHeader(chunk.len()));
    }
    let kind = StreamKind::from_tag(chunk[STREAM_TYPE_OFFSET])?;
    let len = payload_len(chunk);
    let available = chunk.len() - HEADER_LEN;
    if available < len {
        return Err(FrameError::TruncatedPayload {
            expected: len,
            actual: available,
        });
    }

    Ok(LogFrame {
        kind,
        payload: chunk[HEADER_LEN..HEADER_LEN + len].to_vec(),
    })
}

/// Encode a payload as a single frame.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[kind.tag(), 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reassembles frames from arbitrarily split transport chunks.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<LogFrame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = StreamKind::from_tag(self.buf[STREAM_TYPE_OFFSET])?;
        let end = HEADER_LEN + payload_len(&self.buf);
        if self.buf.len() < end {
            return Ok(None);
        }

        let payload = self.buf[HEADER_LEN..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(LogFrame { kind, payload }))
    }

    /// Check that the stream ended on a frame boundary.
    pub fn finish(self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        decode_frame(&self.buf).map(|_| ())
    }
}

/// Receiver for decoded frames.
pub trait LogSink: Send {
    fn write_frame(&mut self, frame: &LogFrame) -> io::Result<()>;
}

/// Writes frames to this process's stdout or stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl LogSink for StdioSink {
    fn write_frame(&mut self, frame: &LogFrame) -> io::Result<()> {
        match frame.kind {
            StreamKind::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(&frame.payload)?;
                out.flush()
            }
            StreamKind::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(&frame.payload)?;
                err.flush()
            }
        }
    }
}

impl LogSink for Vec<LogFrame> {
    fn write_frame(&mut self, frame: &LogFrame) -> io::Result<()> {
        self.push(frame.clone());
        Ok(())
    }
}
