//! Resilient Stream Controller
//!
//! The public entry point. Owns at most one logical operation at a time and
//! drives it through retries with token rotation.
//!
//! # State Machine
//!
//! ```text
//! Idle ─► Starting ─► Active ─┬─────────────────────────► Settled(Completed)
//!            ▲                ├─ retryable, budget left ─► Retrying ─┐
//!            └────────────────┼──────────────────────────────────────┘
//!                             └─ budget spent / fatal ───► Settled(Failed)
//! any running state ─ cancel() / superseded ─────────────► Settled(Cancelled)
//! ```
//!
//! # Supersession
//!
//! Every subscriber callback runs inside a re-entrant gate after checking
//! that its operation (and session) is still the authoritative one. A new
//! `start` or a `cancel` rewrites the authority under the same gate, so a
//! stale callback can never interleave with or follow a supersession, no
//! matter how slowly the old transport honours cancellation. The gate is
//! re-entrant so subscribers may call `start`/`cancel` from a callback.

mod retry;
mod subscriber;

pub use retry::{RetryConfig, RetryPolicy};
pub use subscriber::{ChannelSubscriber, SharedTextBuffer, StreamSubscriber, SubscriberEvent};

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{AuthFailureKind, CredentialError, StreamError};
use crate::session::{
    SessionConfig, SessionId, SessionListener, SessionOutcome, StreamSession,
};
use crate::token::{Token, TokenStore};
use crate::transport::{StreamRequest, StreamTransport};

// ============================================================================
// Configuration
// ============================================================================

/// Controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Retry budget and backoff
    pub retry: RetryConfig,
    /// Token age after which it is rotated before use
    ///
    /// Must be shorter than the token's hard TTL.
    pub refresh_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            refresh_interval: Duration::from_secs(10 * 60),
        }
    }
}

// ============================================================================
// Identifiers and States
// ============================================================================

/// Identifier of one logical operation (one `start` call)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    /// The raw sequence number
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// How an operation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// All text delivered, `on_done` fired
    Completed,
    /// Retries exhausted or fatal error, `on_error` fired
    Failed,
    /// Cancelled or superseded; no terminal callback
    Cancelled,
}

/// Controller (or operation) lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing started yet
    #[default]
    Idle,
    /// Acquiring a token and opening the stream
    Starting,
    /// A session is streaming
    Active,
    /// Waiting out a backoff before the next attempt
    Retrying,
    /// Finished
    Settled(Settlement),
}

impl ControllerState {
    /// Whether an operation is in flight
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Retrying)
    }

    /// The settlement, once settled
    #[must_use]
    pub fn settlement(self) -> Option<Settlement> {
        match self {
            Self::Settled(settlement) => Some(settlement),
            _ => None,
        }
    }
}

/// Terminal result computed by the driver
enum Finish {
    Completed,
    Failed(StreamError),
    Cancelled,
}

impl Finish {
    fn settlement(&self) -> Settlement {
        match self {
            Self::Completed => Settlement::Completed,
            Self::Failed(_) => Settlement::Failed,
            Self::Cancelled => Settlement::Cancelled,
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Which operation and session may currently reach the subscriber
#[derive(Debug, Default)]
struct Authority {
    operation: Option<OperationId>,
    session: Option<SessionId>,
}

struct ActiveOperation {
    id: OperationId,
    cancel: CancellationToken,
}

/// State shared between the controller, its handles and driver tasks
///
/// Lock order: `gate` before `active`. Neither is held across an await.
struct Shared {
    transport: Arc<dyn StreamTransport>,
    tokens: Arc<TokenStore>,
    config: ControllerConfig,
    session_config: Arc<SessionConfig>,
    gate: ReentrantMutex<RefCell<Authority>>,
    active: Mutex<Option<ActiveOperation>>,
    state_tx: watch::Sender<ControllerState>,
    next_operation: AtomicU64,
    next_session: AtomicU64,
}

impl Shared {
    fn is_current(&self, operation: OperationId) -> bool {
        self.gate.lock().borrow().operation == Some(operation)
    }

    /// Run `deliver` only if the caller is still authoritative
    fn deliver(
        &self,
        operation: OperationId,
        session: Option<SessionId>,
        deliver: impl FnOnce(),
    ) -> bool {
        let gate = self.gate.lock();
        let authorized = {
            let authority = gate.borrow();
            authority.operation == Some(operation)
                && match session {
                    Some(session) => authority.session == Some(session),
                    None => true,
                }
        };

        if authorized {
            deliver();
        } else {
            tracing::trace!(%operation, ?session, "Discarding callback from superseded operation");
        }
        authorized
    }

    /// Record `state` on the operation, and on the controller if current
    fn publish(
        &self,
        operation: OperationId,
        status: &watch::Sender<ControllerState>,
        state: ControllerState,
    ) {
        status.send_replace(state);
        let gate = self.gate.lock();
        if gate.borrow().operation == Some(operation) {
            self.state_tx.send_replace(state);
        }
    }

    /// Make `session` the only session allowed to deliver for `operation`
    fn authorize_session(&self, operation: OperationId, session: SessionId) -> bool {
        let gate = self.gate.lock();
        let mut authority = gate.borrow_mut();
        if authority.operation != Some(operation) {
            return false;
        }
        authority.session = Some(session);
        true
    }

    /// Cancel the active operation (or only `target`, when given)
    fn cancel_operation(&self, target: Option<OperationId>) -> bool {
        let gate = self.gate.lock();
        let cancelled = {
            let mut active = self.active.lock();
            let matches = active.as_ref().is_some_and(|op| match target {
                Some(target) => target == op.id,
                None => true,
            });
            if matches {
                active.take()
            } else {
                None
            }
        };
        let Some(cancelled) = cancelled else {
            return false;
        };

        *gate.borrow_mut() = Authority::default();
        cancelled.cancel.cancel();
        self.state_tx
            .send_replace(ControllerState::Settled(Settlement::Cancelled));
        drop(gate);

        tracing::debug!(operation = %cancelled.id, "Operation cancelled");
        true
    }

    /// Final bookkeeping for an operation; fires the terminal callback
    fn settle(
        &self,
        operation: OperationId,
        status: &watch::Sender<ControllerState>,
        finish: Finish,
        subscriber: &dyn StreamSubscriber,
    ) {
        let gate = self.gate.lock();
        let current = gate.borrow().operation == Some(operation);
        let settlement = if current {
            finish.settlement()
        } else {
            Settlement::Cancelled
        };

        if current {
            *gate.borrow_mut() = Authority::default();
            {
                let mut active = self.active.lock();
                if active.as_ref().is_some_and(|op| op.id == operation) {
                    *active = None;
                }
            }
            self.state_tx.send_replace(ControllerState::Settled(settlement));

            match &finish {
                Finish::Completed => {
                    tracing::info!(%operation, "Stream completed");
                    subscriber.on_done();
                }
                Finish::Failed(error) => {
                    tracing::warn!(%operation, error = %error, "Stream failed");
                    subscriber.on_error(error);
                }
                Finish::Cancelled => {}
            }
        } else {
            tracing::debug!(%operation, ?settlement, "Superseded operation wound down");
        }
        drop(gate);

        status.send_replace(ControllerState::Settled(settlement));
    }

    async fn drive(
        self: Arc<Self>,
        operation: OperationId,
        request: StreamRequest,
        subscriber: Arc<dyn StreamSubscriber>,
        cancel: CancellationToken,
        status: watch::Sender<ControllerState>,
    ) {
        let finish = self
            .run_attempts(operation, &request, subscriber.as_ref(), &cancel, &status)
            .await;
        self.settle(operation, &status, finish, subscriber.as_ref());
    }

    async fn run_attempts(
        &self,
        operation: OperationId,
        request: &StreamRequest,
        subscriber: &dyn StreamSubscriber,
        cancel: &CancellationToken,
        status: &watch::Sender<ControllerState>,
    ) -> Finish {
        let mut policy = RetryPolicy::new(self.config.retry.clone());

        loop {
            self.publish(operation, status, ControllerState::Starting);

            let attempt = policy.attempt_index();
            let force_refresh =
                attempt > 0 || self.tokens.needs_rotation(self.config.refresh_interval);
            let token = tokio::select! {
                biased;
                () = cancel.cancelled() => return Finish::Cancelled,
                token = self.tokens.get(force_refresh) => token,
            };

            let error = match token {
                Ok(token) => {
                    let outcome = self
                        .run_session(operation, token, request, subscriber, cancel, status)
                        .instrument(tracing::debug_span!("attempt", attempt))
                        .await;
                    match outcome {
                        SessionOutcome::Completed => return Finish::Completed,
                        SessionOutcome::Cancelled => return Finish::Cancelled,
                        SessionOutcome::AuthFailure(kind) => StreamError::AuthFailure(kind),
                        SessionOutcome::Failed(error) => error,
                    }
                }
                Err(error) => StreamError::Credential(error),
            };

            if cancel.is_cancelled() {
                return Finish::Cancelled;
            }
            if !error.is_retryable() {
                return Finish::Failed(error);
            }

            self.tokens.invalidate();
            if !policy.can_retry() {
                tracing::debug!(
                    %operation,
                    attempts = attempt + 1,
                    "Retry budget exhausted"
                );
                return Finish::Failed(error);
            }

            let delay = policy.advance();
            let attempt = policy.attempt_index();
            tracing::info!(
                %operation,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                auth = error.is_auth_failure(),
                error = %error,
                "Retrying stream"
            );
            self.publish(operation, status, ControllerState::Retrying);
            self.deliver(operation, None, || subscriber.on_retry(attempt, &error));

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Finish::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        operation: OperationId,
        token: Token,
        request: &StreamRequest,
        subscriber: &dyn StreamSubscriber,
        cancel: &CancellationToken,
        status: &watch::Sender<ControllerState>,
    ) -> SessionOutcome {
        let session_id = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        if !self.authorize_session(operation, session_id) {
            return SessionOutcome::Failed(StreamError::Superseded);
        }

        let session = StreamSession::new(session_id, token, self.session_config.clone());
        let handle = session.handle();
        self.publish(operation, status, ControllerState::Active);

        let delivery = Delivery {
            shared: self,
            operation,
            subscriber,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                handle.cancel();
                SessionOutcome::Cancelled
            }
            outcome = session.start(self.transport.as_ref(), request, &delivery) => outcome,
        }
    }
}

/// Routes session callbacks through the gate
struct Delivery<'a> {
    shared: &'a Shared,
    operation: OperationId,
    subscriber: &'a dyn StreamSubscriber,
}

impl SessionListener for Delivery<'_> {
    fn on_text_delta(&self, session: SessionId, text: &str) {
        self.shared
            .deliver(self.operation, Some(session), || self.subscriber.on_delta(text));
    }

    fn on_auth_failure(&self, session: SessionId, kind: AuthFailureKind) {
        tracing::debug!(operation = %self.operation, %session, %kind, "Session auth failure");
    }

    fn on_complete(&self, session: SessionId) {
        tracing::trace!(operation = %self.operation, %session, "Session complete");
    }

    fn on_error(&self, session: SessionId, error: &StreamError) {
        tracing::debug!(operation = %self.operation, %session, error = %error, "Session error");
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Handle to one started operation
#[derive(Clone)]
pub struct SubscriptionHandle {
    operation: OperationId,
    status: watch::Receiver<ControllerState>,
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    /// Operation identifier
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.operation
    }

    /// Latest state of this operation
    #[must_use]
    pub fn status(&self) -> ControllerState {
        *self.status.borrow()
    }

    /// Whether this operation is still the authoritative one
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.shared.is_current(self.operation)
    }

    /// Cancel this operation if it is still the active one
    pub fn cancel(&self) {
        self.shared.cancel_operation(Some(self.operation));
    }

    /// Wait until the operation settles
    ///
    /// Resolves after the terminal callback (if any) has returned.
    pub async fn settled(&self) -> Settlement {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|state| state.settlement().is_some())
            .await
            .ok()
            .and_then(|state| state.settlement());
        settled.unwrap_or(Settlement::Cancelled)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("operation", &self.operation)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Streams a request to a subscriber, retrying with token rotation
///
/// Dropping the controller cancels the active operation.
pub struct ResilientStreamController {
    shared: Arc<Shared>,
}

impl ResilientStreamController {
    /// Create a controller with the default session configuration
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        tokens: Arc<TokenStore>,
        config: ControllerConfig,
    ) -> Self {
        Self::with_session_config(transport, tokens, config, SessionConfig::default())
    }

    /// Create a controller with a custom session configuration
    pub fn with_session_config(
        transport: Arc<dyn StreamTransport>,
        tokens: Arc<TokenStore>,
        config: ControllerConfig,
        session_config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                tokens,
                config,
                session_config: Arc::new(session_config),
                gate: ReentrantMutex::new(RefCell::new(Authority::default())),
                active: Mutex::new(None),
                state_tx,
                next_operation: AtomicU64::new(0),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Start a new logical operation
    ///
    /// Any operation still running is superseded first: its callbacks are
    /// suppressed from this point on and its session is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(
        &self,
        request: StreamRequest,
        subscriber: Arc<dyn StreamSubscriber>,
    ) -> SubscriptionHandle {
        let operation = OperationId(self.shared.next_operation.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(ControllerState::Starting);

        {
            let gate = self.shared.gate.lock();
            let previous = self.shared.active.lock().replace(ActiveOperation {
                id: operation,
                cancel: cancel.clone(),
            });
            *gate.borrow_mut() = Authority {
                operation: Some(operation),
                session: None,
            };
            if let Some(previous) = previous {
                previous.cancel.cancel();
                tracing::debug!(superseded = %previous.id, %operation, "Superseding operation");
            }
            self.shared.state_tx.send_replace(ControllerState::Starting);
        }

        tracing::debug!(%operation, endpoint = %request.endpoint, "Starting operation");
        let span = tracing::info_span!("stream", %operation);
        tokio::spawn(
            self.shared
                .clone()
                .drive(operation, request, subscriber, cancel, status_tx)
                .instrument(span),
        );

        SubscriptionHandle {
            operation,
            status: status_rx,
            shared: self.shared.clone(),
        }
    }

    /// Stop the active operation
    ///
    /// Fires no subscriber callback. Safe to call repeatedly and after
    /// settlement, where it does nothing.
    pub fn cancel(&self) {
        self.shared.cancel_operation(None);
    }

    /// Rotate the token if it has been idle longer than the refresh interval
    ///
    /// Call when the consumer becomes active again. Returns whether a
    /// rotation happened.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the rotation fetch fails.
    pub async fn resume(&self) -> Result<bool, CredentialError> {
        if !self
            .shared
            .tokens
            .needs_rotation(self.shared.config.refresh_interval)
        {
            return Ok(false);
        }
        tracing::debug!("Rotating idle token");
        self.shared.tokens.get(true).await?;
        Ok(true)
    }

    /// Current controller state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.shared.state_tx.subscribe()
    }

    /// The token store this controller rotates
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.shared.tokens
    }

    /// Controller configuration
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }
}

impl Drop for ResilientStreamController {
    fn drop(&mut self) {
        self.shared.cancel_operation(None);
    }
}

impl fmt::Debug for ResilientStreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientStreamController")
            .field("transport", &self.shared.transport.name())
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
