//! Subscribers
//!
//! The consumer-facing side of an operation. Callbacks run synchronously
//! on the driver task while the controller holds its delivery gate, so
//! they should return quickly. They may call back into the controller
//! (`start`, `cancel`).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::StreamError;

/// Receives the output of one logical operation
pub trait StreamSubscriber: Send + Sync {
    /// Next piece of text, in wire order
    fn on_delta(&self, text: &str);

    /// The operation completed
    fn on_done(&self);

    /// The operation failed for good
    ///
    /// Text delivered before the failure stays valid.
    fn on_error(&self, error: &StreamError);

    /// A retry is about to start after `error`
    ///
    /// `attempt` counts retries from 1. Deltas that follow belong to the
    /// new attempt, which starts the text over.
    fn on_retry(&self, attempt: u32, error: &StreamError) {
        let _ = (attempt, error);
    }
}

/// Event forwarded by [`ChannelSubscriber`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// Text delta
    Delta(String),
    /// Retry announced
    Retry {
        /// Retry number (1-based)
        attempt: u32,
        /// Why the previous attempt ended
        reason: String,
    },
    /// Completed
    Done,
    /// Failed
    Error {
        /// Human-readable reason
        message: String,
        /// Underlying error
        error: StreamError,
    },
}

impl SubscriberEvent {
    /// Whether this is the last event of an operation
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Forwards every callback into an unbounded channel
///
/// Lets async code consume an operation with `recv().await`. Events are
/// dropped once the receiver is gone.
#[derive(Clone, Debug)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<SubscriberEvent>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving end
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriberEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SubscriberEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Subscriber receiver dropped");
        }
    }
}

impl StreamSubscriber for ChannelSubscriber {
    fn on_delta(&self, text: &str) {
        self.send(SubscriberEvent::Delta(text.to_string()));
    }

    fn on_done(&self) {
        self.send(SubscriberEvent::Done);
    }

    fn on_error(&self, error: &StreamError) {
        self.send(SubscriberEvent::Error {
            message: error.user_message(),
            error: error.clone(),
        });
    }

    fn on_retry(&self, attempt: u32, error: &StreamError) {
        self.send(SubscriberEvent::Retry {
            attempt,
            reason: error.to_string(),
        });
    }
}

#[derive(Debug, Default)]
struct BufferState {
    text: String,
    finished: bool,
    error: Option<String>,
}

/// Accumulates deltas into a string shared with the consumer
///
/// The buffer mirrors the live attempt: a retry clears it, a terminal
/// failure keeps what was delivered.
#[derive(Clone, Debug, Default)]
pub struct SharedTextBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl SharedTextBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated so far
    #[must_use]
    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    /// Whether a terminal callback arrived
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// User-facing failure reason, if the operation failed
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }
}

impl StreamSubscriber for SharedTextBuffer {
    fn on_delta(&self, text: &str) {
        self.state.lock().text.push_str(text);
    }

    fn on_done(&self) {
        self.state.lock().finished = true;
    }

    fn on_error(&self, error: &StreamError) {
        let mut state = self.state.lock();
        state.finished = true;
        state.error = Some(error.user_message());
    }

    fn on_retry(&self, _attempt: u32, _error: &StreamError) {
        self.state.lock().text.clear();
    }
}
