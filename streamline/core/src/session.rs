//! Stream Session
//!
//! One attempt at consuming a stream: attach the token, open the
//! transport, frame the chunks, pull text deltas out of the payloads and
//! report them to a [`SessionListener`].
//!
//! # Lifecycle
//!
//! ```text
//! Opening ──first frame──► Streaming ──End / close──► Completed
//!    │                         │
//!    └───── error / auth ──────┴──────────────────► Failed
//!    └───── cancel() ─────────────────────────────► Cancelled
//! ```
//!
//! Terminal states are final. Once one is reached no further listener
//! callback fires, even if the transport keeps delivering.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{AuthFailureKind, StreamError, TransportError, AUTH_FAILURE_STATUSES};
use crate::frame::{parse_frames, DataPayload, Frame, FrameParser, ParserConfig};
use crate::token::Token;
use crate::transport::{StreamHandle, StreamRequest, StreamTransport};

/// Default header carrying the anti-forgery token
pub const DEFAULT_TOKEN_HEADER: &str = "X-CSRF-TOKEN";

/// Default in-band authentication failure message
pub const DEFAULT_AUTH_SENTINEL: &str = "Invalid CSRF token";

/// Strictly increasing session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw sequence number
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw sequence number
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Request issued, no frame seen yet
    Opening,
    /// At least one frame received
    Streaming,
    /// End marker seen or server closed cleanly
    Completed,
    /// Transport, parse or authentication failure
    Failed,
    /// Stopped by the owner
    Cancelled,
}

impl SessionState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Recognizes the in-band authentication failure message
///
/// Some servers report a rejected token as ordinary content instead of an
/// HTTP status. This is the only place that knows what that content is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthFailureDetector {
    sentinel: String,
}

impl Default for AuthFailureDetector {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_SENTINEL)
    }
}

impl AuthFailureDetector {
    /// Detector for a specific sentinel
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    /// The sentinel message
    #[must_use]
    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Whether a frame signals an authentication failure
    ///
    /// Matches a bare-string payload, or the text extracted from a
    /// structured one, against the sentinel (surrounding whitespace
    /// ignored).
    #[must_use]
    pub fn is_auth_failure(&self, payload: &DataPayload, extracted: Option<&str>) -> bool {
        let candidate = payload.as_text().or(extracted);
        candidate.is_some_and(|text| text.trim() == self.sentinel)
    }
}

/// A named lookup of one candidate text field
#[derive(Clone, Copy)]
struct FieldExtractor {
    name: &'static str,
    /// Returns the field when the payload has it, whatever its type
    extract: fn(&Map<String, Value>) -> Option<&Value>,
}

impl fmt::Debug for FieldExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FieldExtractor").field(&self.name).finish()
    }
}

fn content_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("content")
}

fn text_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("text")
}

fn data_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("data")
}

fn chunk_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("chunk")
}

fn message_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("message")
}

fn result_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("result")
}

/// Ordered list of candidate text fields; the first present field wins
#[derive(Clone, Debug)]
pub struct TextExtractor {
    extractors: Vec<FieldExtractor>,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self {
            extractors: vec![
                FieldExtractor { name: "content", extract: content_field },
                FieldExtractor { name: "text", extract: text_field },
                FieldExtractor { name: "data", extract: data_field },
                FieldExtractor { name: "chunk", extract: chunk_field },
                FieldExtractor { name: "message", extract: message_field },
                FieldExtractor { name: "result", extract: result_field },
            ],
        }
    }
}

impl TextExtractor {
    /// Text delta carried by a payload
    ///
    /// Bare strings are used as-is. For objects the first present field
    /// decides: a string is the delta, anything else (including `null`)
    /// means the frame carries no text. Later candidates are not consulted.
    #[must_use]
    pub fn extract<'a>(&self, payload: &'a DataPayload) -> Option<&'a str> {
        match payload {
            DataPayload::Text(text) => Some(text.as_str()),
            DataPayload::Object(obj) => {
                let (name, value) = self
                    .extractors
                    .iter()
                    .find_map(|e| (e.extract)(obj).map(|value| (e.name, value)))?;
                let text = value.as_str();
                if text.is_none() {
                    tracing::trace!(field = name, "First present field holds no text");
                }
                text
            }
        }
    }
}

/// Per-session configuration
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Header the token is sent under
    pub token_header: String,
    /// In-band auth failure predicate
    pub auth_detector: AuthFailureDetector,
    /// Text delta extraction
    pub extractor: TextExtractor,
    /// Framing limits and event filters
    pub parser: ParserConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            auth_detector: AuthFailureDetector::default(),
            extractor: TextExtractor::default(),
            parser: ParserConfig::default(),
        }
    }
}

/// Receives the events of one session
pub trait SessionListener: Send + Sync {
    /// One incremental piece of text, in wire order
    fn on_text_delta(&self, session: SessionId, text: &str);

    /// The server rejected the token (in-band sentinel or auth status)
    fn on_auth_failure(&self, session: SessionId, kind: AuthFailureKind);

    /// The stream ended cleanly
    fn on_complete(&self, session: SessionId);

    /// The stream failed for a reason other than authentication
    fn on_error(&self, session: SessionId, error: &StreamError);
}

/// How a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// End marker seen or connection closed cleanly
    Completed,
    /// Token rejected
    AuthFailure(AuthFailureKind),
    /// Transport or parse failure (or misuse)
    Failed(StreamError),
    /// Cancelled through a [`SessionHandle`]
    Cancelled,
}

struct SessionShared {
    id: SessionId,
    state: Mutex<SessionState>,
    stream: StreamHandle,
}

impl SessionShared {
    /// Move to `next` unless already terminal
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        if *state != next {
            tracing::trace!(session = %self.id, from = ?*state, to = ?next, "Session transition");
        }
        *state = next;
        true
    }

    fn is_terminal(&self) -> bool {
        self.state.lock().is_terminal()
    }
}

/// Cloneable control handle for a session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Stop the session
    ///
    /// Aborts the transport and suppresses every pending callback. A no-op
    /// once the session is terminal.
    pub fn cancel(&self) {
        if self.shared.transition(SessionState::Cancelled) {
            tracing::debug!(session = %self.shared.id, "Session cancelled");
        }
        self.shared.stream.cancel();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Cancels the transport stream when the attempt is left by any path
struct StreamGuard<'a> {
    transport: &'a dyn StreamTransport,
    handle: StreamHandle,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if !self.handle.is_cancelled() {
            self.transport.cancel(&self.handle);
        }
    }
}

/// A single streaming attempt
pub struct StreamSession {
    shared: Arc<SessionShared>,
    token: Token,
    config: Arc<SessionConfig>,
    started: AtomicBool,
}

impl StreamSession {
    /// Create a session that will authenticate with `token`
    #[must_use]
    pub fn new(id: SessionId, token: Token, config: Arc<SessionConfig>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id,
                state: Mutex::new(SessionState::Opening),
                stream: StreamHandle::new(),
            }),
            token,
            config,
            started: AtomicBool::new(false),
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Token this session authenticates with
    #[must_use]
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Control handle usable while [`start`](Self::start) is running
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the attempt to its end
    ///
    /// Only the first call runs; later calls return
    /// [`SessionOutcome::Failed`] with [`StreamError::InvalidState`] and fire
    /// no callbacks. Dropping the returned future cancels the transport.
    pub async fn start(
        &self,
        transport: &dyn StreamTransport,
        request: &StreamRequest,
        listener: &dyn SessionListener,
    ) -> SessionOutcome {
        let id = self.shared.id;
        if self.started.swap(true, Ordering::AcqRel) {
            return SessionOutcome::Failed(StreamError::InvalidState(format!(
                "{id} already started"
            )));
        }
        if self.shared.is_terminal() {
            return SessionOutcome::Cancelled;
        }

        let request = request
            .clone()
            .with_header(self.config.token_header.clone(), self.token.value());

        tracing::debug!(
            session = %id,
            transport = transport.name(),
            endpoint = %request.endpoint,
            generation = self.token.generation(),
            "Opening stream"
        );

        let opened = transport.open(&request, self.shared.stream.clone());
        let _guard = StreamGuard {
            transport,
            handle: opened.handle.clone(),
        };
        let mut frames = parse_frames(
            opened.chunks,
            FrameParser::with_config(self.config.parser.clone()),
        );

        let mut deltas = 0usize;
        loop {
            let next = frames.next().await;
            if self.shared.is_terminal() {
                tracing::trace!(session = %id, "Discarding event after cancellation");
                return SessionOutcome::Cancelled;
            }

            match next {
                None | Some(Ok(Frame::End)) => {
                    if !self.shared.transition(SessionState::Completed) {
                        return SessionOutcome::Cancelled;
                    }
                    tracing::debug!(session = %id, deltas, "Stream completed");
                    listener.on_complete(id);
                    return SessionOutcome::Completed;
                }
                Some(Ok(Frame::Comment(_))) => {
                    self.shared.transition(SessionState::Streaming);
                }
                Some(Ok(Frame::Data(frame))) => {
                    self.shared.transition(SessionState::Streaming);
                    let text = self.config.extractor.extract(&frame.payload);

                    if self
                        .config
                        .auth_detector
                        .is_auth_failure(&frame.payload, text)
                    {
                        return self.fail_auth(listener, AuthFailureKind::Sentinel);
                    }

                    match text {
                        Some(text) if !text.is_empty() => {
                            deltas += 1;
                            listener.on_text_delta(id, text);
                        }
                        _ => {
                            tracing::trace!(session = %id, "Frame carried no text");
                        }
                    }
                }
                Some(Err(StreamError::Transport(TransportError::Status { status, .. })))
                    if AUTH_FAILURE_STATUSES.contains(&status) =>
                {
                    return self.fail_auth(listener, AuthFailureKind::Status(status));
                }
                Some(Err(error)) => {
                    if !self.shared.transition(SessionState::Failed) {
                        return SessionOutcome::Cancelled;
                    }
                    tracing::debug!(session = %id, error = %error, "Stream failed");
                    listener.on_error(id, &error);
                    return SessionOutcome::Failed(error);
                }
            }
        }
    }

    fn fail_auth(&self, listener: &dyn SessionListener, kind: AuthFailureKind) -> SessionOutcome {
        if !self.shared.transition(SessionState::Failed) {
            return SessionOutcome::Cancelled;
        }
        tracing::debug!(session = %self.shared.id, %kind, "Authentication rejected");
        listener.on_auth_failure(self.shared.id, kind);
        SessionOutcome::AuthFailure(kind)
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
