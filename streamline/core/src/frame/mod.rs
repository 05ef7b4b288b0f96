//! Frame Layer
//!
//! Turns the raw chunk sequence of a transport into typed frames.
//!
//! The parser only does framing. Which field of a payload holds the text
//! delta is an application convention decided by the session.

mod parser;

pub use parser::{FrameParser, ParserConfig, DEFAULT_MAX_LINE_BYTES};

use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};

use crate::error::StreamError;
use crate::transport::RawChunkStream;

/// One decoded unit of server-pushed data
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Application payload
    Data(DataFrame),
    /// Heartbeat or keep-alive; consumers ignore it
    Comment(String),
    /// Explicit end of stream
    End,
}

/// Payload-carrying frame
#[derive(Clone, Debug, PartialEq)]
pub struct DataFrame {
    /// Event type, when the server named one
    pub event: Option<String>,
    /// Last event id seen at dispatch time
    pub id: Option<String>,
    /// The data itself
    pub payload: DataPayload,
}

/// Data carried by a [`DataFrame`]
#[derive(Clone, Debug, PartialEq)]
pub enum DataPayload {
    /// A bare string
    Text(String),
    /// A small structured object
    Object(Map<String, Value>),
}

impl DataPayload {
    /// Classify the joined `data:` lines of one event
    ///
    /// JSON objects become [`Object`](Self::Object), JSON strings are
    /// decoded, and everything else is kept verbatim.
    #[must_use]
    pub fn from_data(data: String) -> Self {
        match data.trim_start().as_bytes().first() {
            Some(b'{' | b'"') => match serde_json::from_str::<Value>(&data) {
                Ok(Value::Object(map)) => Self::Object(map),
                Ok(Value::String(text)) => Self::Text(text),
                _ => Self::Text(data),
            },
            _ => Self::Text(data),
        }
    }

    /// The bare string, if this is a text payload
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Object(_) => None,
        }
    }
}

/// Lazy sequence of frames
pub type FrameStream = BoxStream<'static, Result<Frame, StreamError>>;

struct FrameStreamState {
    chunks: RawChunkStream,
    parser: FrameParser,
    done: bool,
}

/// Decode a raw chunk sequence into frames
///
/// The first error (transport or framing) is yielded and ends the
/// sequence. When the chunks end cleanly the parser is flushed, so a final
/// event without a trailing blank line is still delivered.
pub fn parse_frames(chunks: RawChunkStream, parser: FrameParser) -> FrameStream {
    let state = FrameStreamState {
        chunks,
        parser,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            match state.parser.next_frame() {
                Ok(Some(frame)) => return Some((Ok(frame), state)),
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
            }

            match state.chunks.next().await {
                Some(Ok(bytes)) => state.parser.push(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    tracing::debug!(
                        error = %e,
                        last_event_id = state.parser.last_event_id(),
                        retry_hint_ms = state
                            .parser
                            .retry_hint()
                            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                        "Chunk stream failed"
                    );
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    return match state.parser.finish() {
                        Ok(Some(frame)) => Some((Ok(frame), state)),
                        Ok(None) => None,
                        Err(e) => Some((Err(e.into()), state)),
                    };
                }
            }
        }
    })
    .boxed()
}
