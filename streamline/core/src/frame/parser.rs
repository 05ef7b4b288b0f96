//! Server-Sent Events Frame Parser
//!
//! Incremental decoder for the `text/event-stream` wire format.
//!
//! # Wire Format
//!
//! ```text
//! : keep-alive                     <- comment line
//! event: message                   <- optional event type
//! id: 42                           <- optional last-event id
//! data: {"content":"Hel"}          <- one or more data lines
//!                                  <- blank line dispatches the frame
//! ```
//!
//! Lines end in `\n`, `\r\n` or a lone `\r`. Bytes are buffered until a
//! full line is available, so a frame (or a multi-byte character) split
//! across any number of chunks decodes the same as when delivered whole.

use std::borrow::Cow;
use std::time::Duration;

use super::{DataFrame, DataPayload, Frame};
use crate::error::FrameError;

/// Default upper bound for a single unterminated line
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Minimum buffer capacity before compaction kicks in
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Data value that marks the end of the stream
const END_MARKER: &str = "[DONE]";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Parser configuration
#[derive(Clone, Debug)]
pub struct ParserConfig {
    /// Longest line accepted before the stream is declared malformed
    pub max_line_bytes: usize,
    /// Event types delivered as [`Frame::Data`]
    ///
    /// A frame without an `event:` field is of type `message`.
    pub data_events: Vec<String>,
    /// Event types that terminate the stream
    pub end_events: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            data_events: vec!["message".to_string()],
            end_events: vec!["end".to_string(), "done".to_string()],
        }
    }
}

/// Fields collected for the frame being assembled
#[derive(Debug, Default)]
struct PendingFrame {
    data: Vec<String>,
    event: Option<String>,
    comment: Option<String>,
}

/// Incremental SSE decoder
///
/// Feed bytes with [`push`](Self::push), drain frames with
/// [`next_frame`](Self::next_frame), and call [`finish`](Self::finish) once
/// the byte source ends. One parser per stream; it cannot be rewound.
#[derive(Debug)]
pub struct FrameParser {
    config: ParserConfig,
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Bytes before this offset hold no line terminator
    scan_pos: usize,
    /// Previous line ended in `\r`; a leading `\n` belongs to it
    skip_lf: bool,
    bom_checked: bool,
    pending: PendingFrame,
    last_event_id: Option<String>,
    retry_hint: Option<Duration>,
    failure: Option<FrameError>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Create a parser with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ParserConfig::default())
    }

    /// Create a parser with custom configuration
    #[must_use]
    pub fn with_config(config: ParserConfig) -> Self {
        Self {
            config,
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            skip_lf: false,
            bom_checked: false,
            pending: PendingFrame::default(),
            last_event_id: None,
            retry_hint: None,
            failure: None,
        }
    }

    /// Append raw bytes
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos = self.scan_pos.saturating_sub(self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Most recent `id:` value seen
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Most recent `retry:` value seen
    #[must_use]
    pub fn retry_hint(&self) -> Option<Duration> {
        self.retry_hint
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the stream can no longer be framed; every later call
    ///   returns the same error
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        while let Some(line) = self.take_line() {
            if let Some(frame) = self.process_line(&line) {
                return Ok(Some(frame));
            }
        }

        if self.available() > self.config.max_line_bytes {
            return Err(self.fail(FrameError::LineTooLong {
                limit: self.config.max_line_bytes,
            }));
        }
        Ok(None)
    }

    /// Flush at end of input
    ///
    /// A trailing unterminated line is processed as if terminated, then any
    /// frame still being assembled is dispatched. Drain
    /// [`next_frame`](Self::next_frame) first.
    pub fn finish(&mut self) -> Result<Option<Frame>, FrameError> {
        if let Some(frame) = self.next_frame()? {
            return Ok(Some(frame));
        }

        if self.available() > 0 {
            let rest = self.buffer.split_off(self.read_pos);
            self.buffer.clear();
            self.read_pos = 0;
            self.scan_pos = 0;
            let line = decode_line(&rest);
            if let Some(frame) = self.process_line(&line) {
                return Ok(Some(frame));
            }
        }

        Ok(self.dispatch())
    }

    fn fail(&mut self, error: FrameError) -> FrameError {
        tracing::debug!(error = %error, "Frame parser failed");
        self.failure = Some(error.clone());
        error
    }

    /// Pop the next complete line from the buffer
    fn take_line(&mut self) -> Option<String> {
        if !self.bom_checked {
            if self.available() < UTF8_BOM.len()
                && UTF8_BOM.starts_with(&self.buffer[self.read_pos..])
            {
                // Could still be the start of a BOM
                return None;
            }
            if self.buffer[self.read_pos..].starts_with(UTF8_BOM) {
                self.read_pos += UTF8_BOM.len();
            }
            self.bom_checked = true;
        }

        if self.skip_lf && self.available() > 0 {
            if self.buffer[self.read_pos] == b'\n' {
                self.read_pos += 1;
            }
            self.skip_lf = false;
        }

        let start = self.scan_pos.max(self.read_pos);
        let Some(offset) = self.buffer[start..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
        else {
            self.scan_pos = self.buffer.len();
            return None;
        };

        let unread = &self.buffer[self.read_pos..];
        let end = start - self.read_pos + offset;
        let line = decode_line(&unread[..end]);

        let mut consumed = end + 1;
        if unread[end] == b'\r' {
            match unread.get(end + 1) {
                Some(b'\n') => consumed += 1,
                Some(_) => {}
                None => self.skip_lf = true,
            }
        }
        self.read_pos += consumed;

        Some(line)
    }

    /// Apply one line; returns a frame when the line dispatches one
    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(comment) = line.strip_prefix(':') {
            let comment = comment.strip_prefix(' ').unwrap_or(comment);
            self.pending.comment = Some(comment.to_string());
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.pending.data.push(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_hint = Some(Duration::from_millis(ms));
                }
            }
            other => tracing::trace!(field = other, "Ignoring unknown field"),
        }

        None
    }

    /// Turn the assembled fields into a frame
    fn dispatch(&mut self) -> Option<Frame> {
        let pending = std::mem::take(&mut self.pending);
        let event = pending.event.as_deref().unwrap_or("message");

        if self.config.end_events.iter().any(|e| e == event) {
            return Some(Frame::End);
        }

        if pending.data.is_empty() {
            return pending.comment.map(Frame::Comment);
        }

        let data = pending.data.join("\n");
        if !self.config.data_events.iter().any(|e| e == event) {
            tracing::debug!(event, "Skipping unrecognized event type");
            return None;
        }

        if data == END_MARKER {
            return Some(Frame::End);
        }

        Some(Frame::Data(DataFrame {
            event: pending.event,
            id: self.last_event_id.clone(),
            payload: DataPayload::from_data(data),
        }))
    }
}

/// Decode one line, replacing invalid UTF-8 sequences
///
/// Line terminators never occur inside a multi-byte sequence, so a bad
/// byte damages only its own line.
fn decode_line(bytes: &[u8]) -> String {
    match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(line) => line.to_string(),
        Cow::Owned(line) => {
            tracing::debug!(len = bytes.len(), "Replaced invalid UTF-8 in line");
            line
        }
    }
}
