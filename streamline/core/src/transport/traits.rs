//! Transport Traits
//!
//! A [`StreamTransport`] opens one outbound request and hands back a lazy,
//! finite sequence of raw chunks. Failures are reported as an `Err` item on
//! that sequence rather than from `open`, so callers can tell "never
//! started" (first item is an error) from "started then died" (an error
//! after data).

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::TransportError;

/// Raw chunk sequence delivered by a transport
pub type RawChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// HTTP method for a stream request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET (no body)
    Get,
    /// POST (the common case for summarize actions)
    #[default]
    Post,
}

impl Method {
    /// Method name as sent on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            other => Err(TransportError::InvalidRequest(format!(
                "unsupported method: {other}"
            ))),
        }
    }
}

/// One logical streaming request
///
/// Immutable for the lifetime of an operation; retries reuse it and only
/// the session-attached token header differs between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    /// Target URL
    pub endpoint: Url,
    /// HTTP method
    pub method: Method,
    /// Opaque request body
    pub body: Option<Bytes>,
    /// Headers added on top of the transport defaults
    pub extra_headers: HashMap<String, String>,
}

impl StreamRequest {
    /// Create a POST request with no body
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            method: Method::Post,
            body: None,
            extra_headers: HashMap::new(),
        }
    }

    /// Create a GET request
    #[must_use]
    pub fn get(endpoint: Url) -> Self {
        Self::new(endpoint).with_method(Method::Get)
    }

    /// Create a POST request with a JSON body
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn post_json<T: Serialize>(endpoint: Url, body: &T) -> Result<Self, TransportError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(Self::new(endpoint)
            .with_body(bytes)
            .with_header("content-type", "application/json"))
    }

    /// Set the method
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Add or replace a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.extra_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Cancellation handle for one opened stream
///
/// Cloning shares the underlying cancellation; cancelling any clone ends
/// the chunk sequence.
#[derive(Clone, Debug, Default)]
pub struct StreamHandle {
    token: CancellationToken,
}

impl StreamHandle {
    /// Create a fresh handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the stream
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the stream was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wrap a chunk sequence so it ends as soon as this handle is cancelled
    ///
    /// The inner stream is dropped at that point, which closes the
    /// underlying connection.
    #[must_use]
    pub fn guard(&self, chunks: RawChunkStream) -> RawChunkStream {
        if self.is_cancelled() {
            return futures::stream::empty().boxed();
        }
        chunks
            .take_until(self.token.clone().cancelled_owned())
            .boxed()
    }
}

/// Result of [`StreamTransport::open`]
pub struct OpenedStream {
    /// Cancels the request
    pub handle: StreamHandle,
    /// Raw body chunks; ends when the server closes or the handle is cancelled
    pub chunks: RawChunkStream,
}

impl fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Something that can open a streamed request
pub trait StreamTransport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Issue the request and return its chunk sequence
    ///
    /// Never fails synchronously; connection and status errors arrive as
    /// the first item of `chunks`.
    fn open(&self, request: &StreamRequest, handle: StreamHandle) -> OpenedStream;

    /// Abort a stream opened by this transport
    ///
    /// Best-effort: a chunk already in flight may still be observed, so
    /// callers must discard anything that arrives after cancelling.
    fn cancel(&self, handle: &StreamHandle) {
        handle.cancel();
    }
}
