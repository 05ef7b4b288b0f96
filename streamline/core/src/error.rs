//! Error Taxonomy
//!
//! Errors are split by where they originate so the controller can decide
//! locally whether an attempt is worth repeating:
//!
//! - [`TransportError`]: the connection never came up or died mid-stream
//! - [`FrameError`]: the byte stream can no longer be framed
//! - [`CredentialError`]: the anti-forgery token could not be minted
//! - [`StreamError`]: the umbrella type surfaced by sessions and the controller
//!
//! Only [`StreamError::is_retryable`] errors are retried; everything else
//! escalates to the subscriber immediately.

use thiserror::Error;

/// HTTP statuses that mean "your credentials were rejected".
///
/// 419 is the status some frameworks use for an expired anti-forgery token.
pub const AUTH_FAILURE_STATUSES: &[u16] = &[401, 403, 419];

/// Errors raised by a [`StreamTransport`](crate::transport::StreamTransport)
/// on its chunk sequence
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request could not be sent or the connection was refused
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server answered with a non-success status before any data
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Bounded preview of the response body
        body: String,
    },

    /// The connection was reset or the body read failed after streaming began
    #[error("stream interrupted: {0}")]
    Interrupted(String),

    /// The request itself was malformed (bad header, bad method)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether this is an out-of-band authentication rejection
    #[must_use]
    pub fn is_auth_status(&self) -> bool {
        matches!(self, Self::Status { status, .. } if AUTH_FAILURE_STATUSES.contains(status))
    }

    /// Whether repeating the request could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Interrupted(_) => true,
            Self::Status { status, .. } => {
                AUTH_FAILURE_STATUSES.contains(status)
                    || *status == 408
                    || *status == 429
                    || *status >= 500
            }
            Self::InvalidRequest(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::ConnectionFailed(err.to_string())
        } else {
            Self::Interrupted(err.to_string())
        }
    }
}

/// Unrecoverable framing errors
///
/// Unknown event types are skipped and undecodable bytes are replaced;
/// these are the cases where the parser can no longer tell where the next
/// frame begins.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A line grew past the configured limit without a terminator
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong {
        /// Configured maximum line length in bytes
        limit: usize,
    },
}

/// Errors from the credential provider
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The token endpoint could not be reached
    #[error("token request failed: {0}")]
    Request(String),

    /// The token endpoint answered with a non-success status
    #[error("token endpoint returned {0}")]
    Status(u16),

    /// The response carried no recognizable token
    #[error("token endpoint response did not contain a token")]
    MissingToken,
}

impl From<reqwest::Error> for CredentialError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// How an authentication failure was signalled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthFailureKind {
    /// The server sent the sentinel message as ordinary data
    Sentinel,
    /// The server answered with an auth status code
    Status(u16),
}

impl std::fmt::Display for AuthFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sentinel => write!(f, "in-band sentinel"),
            Self::Status(status) => write!(f, "status {status}"),
        }
    }
}

/// Errors surfaced by sessions and the controller
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Connection never established or died without a clean end marker
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server rejected the anti-forgery token
    #[error("authentication rejected ({0})")]
    AuthFailure(AuthFailureKind),

    /// Framing broke down beyond recovery
    #[error("malformed stream: {0}")]
    Parse(#[from] FrameError),

    /// No token could be acquired for the attempt
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Output discarded because a newer operation started
    #[error("superseded by a newer request")]
    Superseded,

    /// Stopped by the caller
    #[error("cancelled")]
    Cancelled,

    /// An operation was invoked in a state that does not allow it
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StreamError {
    /// Whether the controller may spend a retry on this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::AuthFailure(_) | Self::Credential(_) => true,
            Self::Parse(_) | Self::Superseded | Self::Cancelled | Self::InvalidState(_) => false,
        }
    }

    /// Whether this error means the token should be considered burnt
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::AuthFailure(_) => true,
            Self::Transport(e) => e.is_auth_status(),
            _ => false,
        }
    }

    /// Human-readable reason for the terminal `on_error` callback
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(TransportError::Status { status, .. }) => {
                format!("The server could not produce a response (status {status}).")
            }
            Self::Transport(_) => {
                "The connection to the server was lost. Please try again.".to_string()
            }
            Self::AuthFailure(_) | Self::Credential(_) => {
                "Your session could not be verified. Please reload and try again.".to_string()
            }
            Self::Parse(_) => "The server sent a response that could not be read.".to_string(),
            Self::Superseded => "Replaced by a newer request.".to_string(),
            Self::Cancelled => "Cancelled.".to_string(),
            Self::InvalidState(msg) => format!("Internal error: {msg}"),
        }
    }
}
