//! Controller Behaviour Tests
//!
//! Drive the controller against a scripted in-memory transport and a
//! counting credential provider:
//! - delta ordering and completion
//! - token rotation after authentication failures
//! - bounded retries
//! - supersession and cancellation
//! - idle rotation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use streamline_core::session::DEFAULT_TOKEN_HEADER;
use streamline_core::{
    ChannelSubscriber, ControllerConfig, ControllerState, CredentialError, CredentialProvider,
    IssuedToken, OpenedStream, ParserConfig, RawChunkStream, ResilientStreamController,
    RetryConfig, SessionConfig, Settlement, SharedTextBuffer, StreamError, StreamHandle,
    StreamRequest, StreamSubscriber,
    StreamTransport, SubscriberEvent, TokenStore, TransportError,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

type Chunk = Result<Bytes, TransportError>;

/// What the next opened stream does
enum Script {
    /// Replay these chunks, then close cleanly
    Chunks(Vec<Result<&'static str, TransportError>>),
    /// Replay raw bytes that need not be valid UTF-8, then close cleanly
    Bytes(Vec<&'static [u8]>),
    /// Stay open; the test pushes chunks by hand
    Manual,
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    tokens_seen: Mutex<Vec<String>>,
    manual: Mutex<Vec<mpsc::UnboundedSender<Chunk>>>,
    opened: watch::Sender<usize>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            scripts: Mutex::new(scripts.into()),
            tokens_seen: Mutex::new(Vec::new()),
            manual: Mutex::new(Vec::new()),
            opened,
        }
    }

    fn opens(&self) -> usize {
        *self.opened.borrow()
    }

    fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().clone()
    }

    async fn wait_for_opens(&self, count: usize) {
        let mut opened = self.opened.subscribe();
        tokio::time::timeout(Duration::from_secs(30), opened.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for stream to open")
            .expect("transport dropped");
    }

    /// Push raw text into the n-th manual stream; false once it is closed
    fn push(&self, index: usize, text: &'static str) -> bool {
        let sender = self.manual.lock()[index].clone();
        sender.send(Ok(Bytes::from_static(text.as_bytes()))).is_ok()
    }

    fn manual_sender(&self, index: usize) -> mpsc::UnboundedSender<Chunk> {
        self.manual.lock()[index].clone()
    }
}

impl StreamTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, request: &StreamRequest, handle: StreamHandle) -> OpenedStream {
        self.tokens_seen
            .lock()
            .push(request.header(DEFAULT_TOKEN_HEADER).unwrap_or_default().to_string());

        let script = self.scripts.lock().pop_front().unwrap_or(Script::Manual);
        let chunks: RawChunkStream = match script {
            Script::Chunks(items) => stream::iter(
                items
                    .into_iter()
                    .map(|item| item.map(|text| Bytes::from_static(text.as_bytes()))),
            )
            .boxed(),
            Script::Bytes(items) => {
                stream::iter(items.into_iter().map(|item| Ok(Bytes::from_static(item)))).boxed()
            }
            Script::Manual => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.manual.lock().push(tx);
                UnboundedReceiverStream::new(rx).boxed()
            }
        };
        self.opened.send_modify(|n| *n += 1);

        OpenedStream {
            chunks: handle.guard(chunks),
            handle,
        }
    }
}

/// Issues `token-1`, `token-2`, ... after failing the first `failures` fetches
#[derive(Default)]
struct CountingProvider {
    issued: AtomicU64,
    failures: AtomicU32,
    clears: AtomicU64,
}

impl CountingProvider {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CredentialProvider for CountingProvider {
    async fn fetch_token(&self) -> Result<IssuedToken, CredentialError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CredentialError::Status(503));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(IssuedToken::new(format!("token-{n}")))
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    controller: Arc<ResilientStreamController>,
    transport: Arc<ScriptedTransport>,
    provider: Arc<CountingProvider>,
    tokens: Arc<TokenStore>,
}

fn harness_with(max_attempts: u32, provider: CountingProvider, scripts: Vec<Script>) -> Harness {
    build_harness(max_attempts, provider, SessionConfig::default(), scripts)
}

fn build_harness(
    max_attempts: u32,
    provider: CountingProvider,
    session: SessionConfig,
    scripts: Vec<Script>,
) -> Harness {
    let transport = Arc::new(ScriptedTransport::new(scripts));
    let provider = Arc::new(provider);
    let tokens = Arc::new(TokenStore::new(provider.clone()));
    let config = ControllerConfig {
        retry: RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        },
        ..ControllerConfig::default()
    };
    let controller = Arc::new(ResilientStreamController::with_session_config(
        transport.clone(),
        tokens.clone(),
        config,
        session,
    ));
    Harness {
        controller,
        transport,
        provider,
        tokens,
    }
}

fn harness(max_attempts: u32, scripts: Vec<Script>) -> Harness {
    harness_with(max_attempts, CountingProvider::default(), scripts)
}

fn request() -> StreamRequest {
    StreamRequest::new(Url::parse("http://localhost/summaries/stream").unwrap())
}

fn success() -> Script {
    Script::Chunks(vec![
        Ok("data: {\"content\":\"Hello, \"}\n\n"),
        Ok("data: {\"content\":\"world\"}\n\ndata: [DONE]\n\n"),
    ])
}

fn delta(text: &str) -> SubscriberEvent {
    SubscriberEvent::Delta(text.to_string())
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SubscriberEvent>) -> SubscriberEvent {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for subscriber event")
        .expect("subscriber channel closed")
}

async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<SubscriberEvent>) -> Vec<SubscriberEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

// =============================================================================
// Ordering and Completion
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_deltas_arrive_in_order_then_done() {
    let h = harness(
        3,
        vec![Script::Chunks(vec![
            Ok("data: {\"content\":\"Hel\"}\n"),
            Ok("\ndata: {\"content\":\"lo, \"}\n\nda"),
            Ok("ta: {\"content\":\"world\"}\n\n"),
            Ok("data: [DONE]\n\n"),
            Ok("data: {\"content\":\"after end\"}\n\n"),
        ])],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    let handle = h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    assert_eq!(
        events,
        vec![
            delta("Hel"),
            delta("lo, "),
            delta("world"),
            SubscriberEvent::Done
        ]
    );
    assert_eq!(handle.settled().await, Settlement::Completed);
    assert_eq!(
        h.controller.state(),
        ControllerState::Settled(Settlement::Completed)
    );
    assert_eq!(h.transport.tokens_seen(), vec!["token-1".to_string()]);
    assert_eq!(h.tokens.stats().invalidations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_clean_close_without_end_marker_completes() {
    let h = harness(3, vec![Script::Chunks(vec![Ok("data: only\n\n")])]);
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    h.controller.start(request(), Arc::new(subscriber));

    assert_eq!(
        until_terminal(&mut rx).await,
        vec![delta("only"), SubscriberEvent::Done]
    );
}

// =============================================================================
// Authentication Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sentinel_rotates_token_before_retry() {
    let h = harness(
        3,
        vec![
            Script::Chunks(vec![Ok("data: Invalid CSRF token\n\n")]),
            success(),
        ],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    assert!(matches!(events[0], SubscriberEvent::Retry { attempt: 1, .. }));
    assert_eq!(
        events[1..].to_vec(),
        vec![delta("Hello, "), delta("world"), SubscriberEvent::Done]
    );
    assert_eq!(
        h.transport.tokens_seen(),
        vec!["token-1".to_string(), "token-2".to_string()]
    );
    assert_eq!(h.tokens.stats().invalidations, 1);
    assert_eq!(h.provider.clears.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sentinel_attempt_contributes_no_text() {
    let h = harness(
        3,
        vec![
            Script::Chunks(vec![Ok("data: Invalid CSRF token\n\n")]),
            Script::Chunks(vec![Ok("data: ok\n\n"), Ok("event: end\ndata: \n\n")]),
        ],
    );
    let buffer = SharedTextBuffer::new();

    let handle = h.controller.start(request(), Arc::new(buffer.clone()));

    assert_eq!(handle.settled().await, Settlement::Completed);
    assert_eq!(buffer.text(), "ok");
    assert_eq!(h.tokens.stats().invalidations, 1);
    assert_eq!(h.tokens.stats().acquisitions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_status_rotates_token_before_retry() {
    let h = harness(
        3,
        vec![
            Script::Chunks(vec![Err(TransportError::Status {
                status: 419,
                body: "Page Expired".to_string(),
            })]),
            success(),
        ],
    );
    let buffer = SharedTextBuffer::new();

    let handle = h.controller.start(request(), Arc::new(buffer.clone()));

    assert_eq!(handle.settled().await, Settlement::Completed);
    assert_eq!(buffer.text(), "Hello, world");
    let seen = h.transport.tokens_seen();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1]);
}

#[tokio::test(start_paused = true)]
async fn test_credential_failure_is_retried() {
    let h = harness_with(3, CountingProvider::failing(1), vec![success()]);
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    assert!(matches!(events[0], SubscriberEvent::Retry { attempt: 1, .. }));
    assert_eq!(events.last(), Some(&SubscriberEvent::Done));
    assert_eq!(h.transport.tokens_seen(), vec!["token-1".to_string()]);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_restarts_text() {
    let h = harness(
        3,
        vec![
            Script::Chunks(vec![
                Ok("data: {\"content\":\"Hel\"}\n\n"),
                Err(TransportError::Interrupted("connection reset".to_string())),
            ]),
            success(),
        ],
    );
    let buffer = SharedTextBuffer::new();

    let handle = h.controller.start(request(), Arc::new(buffer.clone()));

    assert_eq!(handle.settled().await, Settlement::Completed);
    assert_eq!(buffer.text(), "Hello, world");
    assert!(buffer.is_finished());
    assert_eq!(buffer.error(), None);
    assert_eq!(h.tokens.stats().invalidations, 1);
    assert_eq!(
        h.transport.tokens_seen(),
        vec!["token-1".to_string(), "token-2".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let failing = || Script::Chunks(vec![Err(TransportError::ConnectionFailed("refused".into()))]);
    let h = harness(2, vec![failing(), failing(), failing()]);
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    let handle = h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], SubscriberEvent::Retry { attempt: 1, .. }));
    assert!(matches!(events[1], SubscriberEvent::Retry { attempt: 2, .. }));
    assert!(matches!(
        &events[2],
        SubscriberEvent::Error {
            error: StreamError::Transport(TransportError::ConnectionFailed(_)),
            ..
        }
    ));
    assert_eq!(handle.settled().await, Settlement::Failed);
    assert_eq!(h.transport.opens(), 3);
    assert_eq!(h.tokens.stats().invalidations, 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_budget_fails_after_one_attempt() {
    let h = harness(
        0,
        vec![Script::Chunks(vec![Ok("data: Invalid CSRF token\n\n")])],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SubscriberEvent::Error {
            error: StreamError::AuthFailure(_),
            ..
        }
    ));
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_status_fails_immediately() {
    let h = harness(
        3,
        vec![Script::Chunks(vec![Err(TransportError::Status {
            status: 404,
            body: "not found".to_string(),
        })])],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    match &events[..] {
        [SubscriberEvent::Error { message, .. }] => assert!(message.contains("404")),
        other => panic!("unexpected events: {other:?}"),
    }
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.tokens.stats().invalidations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_text_survives_final_failure() {
    let h = harness(
        0,
        vec![Script::Chunks(vec![
            Ok("data: {\"content\":\"partial\"}\n\n"),
            Err(TransportError::Interrupted("reset".into())),
        ])],
    );
    let buffer = SharedTextBuffer::new();

    let handle = h.controller.start(request(), Arc::new(buffer.clone()));

    assert_eq!(handle.settled().await, Settlement::Failed);
    assert_eq!(buffer.text(), "partial");
    assert!(buffer.error().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_parse_error_fails_without_retry() {
    let session = SessionConfig {
        parser: ParserConfig {
            max_line_bytes: 32,
            ..ParserConfig::default()
        },
        ..SessionConfig::default()
    };
    let h = build_harness(
        3,
        CountingProvider::default(),
        session,
        vec![Script::Chunks(vec![
            Ok("data: {\"content\":\"ok\"}\n\n"),
            Ok("data: {\"content\":\"this line never ends and keeps growing"),
            Ok(" past the configured limit"),
        ])],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    let handle = h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    match &events[..] {
        [SubscriberEvent::Delta(text), SubscriberEvent::Error { error, .. }] => {
            assert_eq!(text, "ok");
            assert!(matches!(error, StreamError::Parse(_)), "got {error:?}");
        }
        other => panic!("unexpected events: {other:?}"),
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e, SubscriberEvent::Retry { .. })));
    assert_eq!(handle.settled().await, Settlement::Failed);
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.tokens.stats().invalidations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_bytes_do_not_fail_stream() {
    let h = harness(
        3,
        vec![Script::Bytes(vec![
            b"data: bad \xFF\n\n",
            b"data: ok\n\ndata: [DONE]\n\n",
        ])],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();

    let handle = h.controller.start(request(), Arc::new(subscriber));
    let events = until_terminal(&mut rx).await;

    assert_eq!(
        events,
        vec![delta("bad \u{FFFD}"), delta("ok"), SubscriberEvent::Done]
    );
    assert_eq!(handle.settled().await, Settlement::Completed);
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.tokens.stats().invalidations, 0);
}

// =============================================================================
// Supersession and Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_new_start_silences_previous_operation() {
    let h = harness(3, Vec::new());
    let (first_sub, mut first_rx) = ChannelSubscriber::channel();
    let first = h.controller.start(request(), Arc::new(first_sub));

    h.transport.wait_for_opens(1).await;
    assert!(h.transport.push(0, "data: a\n\n"));
    assert_eq!(next_event(&mut first_rx).await, delta("a"));

    let (second_sub, mut second_rx) = ChannelSubscriber::channel();
    let second = h.controller.start(request(), Arc::new(second_sub));

    // Late output from the superseded stream
    let _ = h.transport.push(0, "data: stale\n\ndata: [DONE]\n\n");

    h.transport.wait_for_opens(2).await;
    assert!(h.transport.push(1, "data: fresh\n\ndata: [DONE]\n\n"));

    assert_eq!(
        until_terminal(&mut second_rx).await,
        vec![delta("fresh"), SubscriberEvent::Done]
    );
    assert_eq!(first.settled().await, Settlement::Cancelled);
    assert_eq!(second.settled().await, Settlement::Completed);
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent_and_silent() {
    let h = harness(3, Vec::new());
    let (subscriber, mut rx) = ChannelSubscriber::channel();
    let handle = h.controller.start(request(), Arc::new(subscriber));

    h.transport.wait_for_opens(1).await;
    assert!(h.transport.push(0, "data: partial\n\n"));
    assert_eq!(next_event(&mut rx).await, delta("partial"));

    h.controller.cancel();
    h.controller.cancel();
    handle.cancel();

    assert_eq!(handle.settled().await, Settlement::Cancelled);
    assert_eq!(
        h.controller.state(),
        ControllerState::Settled(Settlement::Cancelled)
    );

    let sender = h.transport.manual_sender(0);
    tokio::time::timeout(Duration::from_secs(30), sender.closed())
        .await
        .expect("stream was not released");
    assert!(!h.transport.push(0, "data: late\n\n"));
    assert!(rx.try_recv().is_err());

    h.controller.cancel();
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let h = harness(
        3,
        vec![Script::Chunks(vec![Err(TransportError::Interrupted(
            "reset".into(),
        ))])],
    );
    let (subscriber, mut rx) = ChannelSubscriber::channel();
    let handle = h.controller.start(request(), Arc::new(subscriber));

    assert!(matches!(
        next_event(&mut rx).await,
        SubscriberEvent::Retry { attempt: 1, .. }
    ));
    h.controller.cancel();

    assert_eq!(handle.settled().await, Settlement::Cancelled);
    assert_eq!(h.transport.opens(), 1);
    assert!(rx.try_recv().is_err());
}

/// Cancels the controller from inside its first delta callback
#[derive(Default)]
struct CancelOnFirstDelta {
    controller: OnceLock<Weak<ResilientStreamController>>,
    deltas: Mutex<Vec<String>>,
    terminal: AtomicU32,
}

impl StreamSubscriber for CancelOnFirstDelta {
    fn on_delta(&self, text: &str) {
        self.deltas.lock().push(text.to_string());
        if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
            controller.cancel();
        }
    }

    fn on_done(&self) {
        self.terminal.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _error: &StreamError) {
        self.terminal.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_may_cancel_from_callback() {
    let h = harness(
        3,
        vec![Script::Chunks(vec![
            Ok("data: one\n\n"),
            Ok("data: two\n\n"),
            Ok("data: [DONE]\n\n"),
        ])],
    );
    let subscriber = Arc::new(CancelOnFirstDelta::default());
    let _ = subscriber.controller.set(Arc::downgrade(&h.controller));

    let handle = h.controller.start(request(), subscriber.clone());

    assert_eq!(handle.settled().await, Settlement::Cancelled);
    assert_eq!(*subscriber.deltas.lock(), vec!["one".to_string()]);
    assert_eq!(subscriber.terminal.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Idle Rotation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_resume_rotates_idle_token() {
    let h = harness(3, vec![success(), success()]);

    let first = h
        .controller
        .start(request(), Arc::new(SharedTextBuffer::new()));
    assert_eq!(first.settled().await, Settlement::Completed);
    assert!(!h.controller.resume().await.unwrap());

    tokio::time::advance(h.controller.config().refresh_interval).await;
    assert!(h.controller.resume().await.unwrap());
    assert_eq!(h.tokens.current().unwrap().value(), "token-2");

    let second = h
        .controller
        .start(request(), Arc::new(SharedTextBuffer::new()));
    assert_eq!(second.settled().await, Settlement::Completed);
    assert_eq!(
        h.transport.tokens_seen(),
        vec!["token-1".to_string(), "token-2".to_string()]
    );
    assert_eq!(h.tokens.stats().acquisitions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_rotates_idle_token_without_resume() {
    let h = harness(3, vec![success(), success()]);

    let first = h
        .controller
        .start(request(), Arc::new(SharedTextBuffer::new()));
    assert_eq!(first.settled().await, Settlement::Completed);

    tokio::time::advance(h.controller.config().refresh_interval).await;

    let second = h
        .controller
        .start(request(), Arc::new(SharedTextBuffer::new()));
    assert_eq!(second.settled().await, Settlement::Completed);
    assert_eq!(
        h.transport.tokens_seen(),
        vec!["token-1".to_string(), "token-2".to_string()]
    );
    assert_eq!(h.tokens.stats().invalidations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_token_is_reused_across_operations() {
    let h = harness(3, vec![success(), success()]);

    for _ in 0..2 {
        let handle = h
            .controller
            .start(request(), Arc::new(SharedTextBuffer::new()));
        assert_eq!(handle.settled().await, Settlement::Completed);
    }

    assert_eq!(
        h.transport.tokens_seen(),
        vec!["token-1".to_string(), "token-1".to_string()]
    );
}
