//! Streaming session controller.
//!
//! One session covers a single prompt: the user message, the request, and the
//! assistant message that grows while the response streams in. Sessions run on
//! their own tokio task; the presentation layer observes them through the
//! update channel returned by [`SessionController::new`] and steers them
//! through the [`SessionHandle`] returned by [`SessionController::start`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::accumulator::{Accumulator, Dialect, snapshots};
use crate::auth::TokenSource;
use crate::config::Config;
use crate::conversation::Conversation;
use crate::decoder::EventStream;
use crate::documents::DocumentResolver;
use crate::error::{ChatStreamError, CoreResult};
use crate::model::{Document, DocumentRef, Message, PromptRequest};
use crate::normalizer::prompt_request;
use crate::telemetry::{
    self, KEY_CHARS, KEY_ERROR_KIND, KEY_OUTCOME, KEY_SNAPSHOTS, SessionTrace,
};
use crate::transport::CompletionTransport;

#[derive(Clone, Default)]
pub struct SessionSettings {
    pub dialect: Dialect,
    /// Used by [`SessionController::resolve_attachments`].
    pub documents: Option<Arc<dyn DocumentResolver>>,
}

impl SessionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            dialect: cfg.stream.dialect,
            documents: None,
        }
    }

    pub fn with_documents(mut self, resolver: Arc<dyn DocumentResolver>) -> Self {
        self.documents = Some(resolver);
        self
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("dialect", &self.dialect)
            .field("documents", &self.documents.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    /// `Sending` or `Streaming`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    RateLimited,
    Unavailable,
    Upstream,
    Transport,
    IncompleteStream,
    Internal,
}

/// What the presentation layer shows when a session fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Text received before an incomplete stream ended. Not kept in the
    /// conversation.
    pub partial_text: Option<String>,
    pub retryable: bool,
}

impl SessionFailure {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            message: message.into(),
            partial_text: None,
            retryable: false,
        }
    }
}

impl From<&ChatStreamError> for SessionFailure {
    fn from(err: &ChatStreamError) -> Self {
        let kind = match err {
            ChatStreamError::Unauthorized => FailureKind::Unauthorized,
            ChatStreamError::RateLimited { .. } => FailureKind::RateLimited,
            ChatStreamError::Unavailable { .. } => FailureKind::Unavailable,
            ChatStreamError::Upstream { .. } => FailureKind::Upstream,
            ChatStreamError::Transport(_) | ChatStreamError::Io(_) => FailureKind::Transport,
            ChatStreamError::IncompleteStream { .. } => FailureKind::IncompleteStream,
            _ => FailureKind::Internal,
        };
        let partial_text = match err {
            ChatStreamError::IncompleteStream { partial } => Some(partial.clone()),
            _ => None,
        };
        Self {
            kind,
            message: err.to_string(),
            partial_text,
            retryable: !matches!(kind, FailureKind::Unauthorized | FailureKind::Internal),
        }
    }
}

/// Ordered notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A message was created or changed. `state` is the session state the
    /// change belongs to.
    Message {
        session: SessionId,
        state: SessionState,
        message: Message,
    },
    Failed {
        session: SessionId,
        failure: SessionFailure,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(Message),
    Cancelled(Message),
    Failed(SessionFailure),
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed(_) => SessionState::Completed,
            Self::Cancelled(_) => SessionState::Cancelled,
            Self::Failed(_) => SessionState::Failed,
        }
    }
}

/// Handle to one running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    join: JoinHandle<SessionOutcome>,
    finished: Option<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Request cancellation. Takes effect at the next pending read; a no-op
    /// once the session is terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the session to end.
    pub async fn outcome(&mut self) -> SessionOutcome {
        if let Some(done) = &self.finished {
            return done.clone();
        }
        let out = match (&mut self.join).await {
            Ok(out) => out,
            Err(e) => SessionOutcome::Failed(SessionFailure::internal(format!(
                "session task ended abnormally: {e}"
            ))),
        };
        self.finished = Some(out.clone());
        out
    }
}

#[derive(Debug)]
struct Slot {
    id: Option<SessionId>,
    state: SessionState,
    cancel: Option<CancellationToken>,
}

struct Inner {
    transport: Arc<dyn CompletionTransport>,
    auth: Arc<dyn TokenSource>,
    conversation: Arc<dyn Conversation>,
    settings: SessionSettings,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    slot: Mutex<Slot>,
    next_id: AtomicU64,
}

/// Drives streaming sessions for one conversation. At most one session is
/// active at a time; a second `start` is rejected with `SessionBusy`.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        auth: Arc<dyn TokenSource>,
        conversation: Arc<dyn Conversation>,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            transport,
            auth,
            conversation,
            settings,
            updates: tx,
            slot: Mutex::new(Slot {
                id: None,
                state: SessionState::Idle,
                cancel: None,
            }),
            next_id: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// State of the current or most recent session.
    pub fn state(&self) -> SessionState {
        self.inner.lock_slot().state
    }

    /// Submit a prompt. Must be called from within a tokio runtime.
    ///
    /// The user message is appended and published before this returns. An
    /// empty prompt fails with `Validation` and changes nothing; a missing
    /// token publishes an `Unauthorized` failure without sending anything.
    pub fn start<I>(&self, prompt: &str, document_refs: I) -> CoreResult<SessionHandle>
    where
        I: IntoIterator<Item = DocumentRef>,
    {
        let request = prompt_request(prompt, document_refs)?;

        let mut slot = self.inner.lock_slot();
        if slot.state.is_active() {
            return Err(ChatStreamError::SessionBusy);
        }
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        let Some(bearer) = self.inner.auth.bearer_token() else {
            let err = ChatStreamError::Unauthorized;
            tracing::warn!(session = %id, "no bearer token; prompt not sent");
            *slot = Slot {
                id: Some(id),
                state: SessionState::Failed,
                cancel: None,
            };
            drop(slot);
            self.inner.publish(SessionUpdate::Failed {
                session: id,
                failure: SessionFailure::from(&err),
            });
            telemetry::emit(
                SessionTrace::new(id.to_string(), self.inner.transport.name())
                    .outcome(SessionState::Failed.as_str())
                    .error(err.kind(), &err.to_string()),
            );
            return Err(err);
        };

        let refs = request.document_refs.iter().cloned().collect();
        let user = Message::user(format!("{id}-user"), request.text.clone(), refs);
        self.inner.conversation.append_message(user.clone());
        self.inner.publish(SessionUpdate::Message {
            session: id,
            state: SessionState::Sending,
            message: user,
        });

        let cancel = CancellationToken::new();
        *slot = Slot {
            id: Some(id),
            state: SessionState::Sending,
            cancel: Some(cancel.clone()),
        };
        drop(slot);

        let span = tracing::info_span!(
            "chat.session",
            session.id = %id,
            session.transport = self.inner.transport.name(),
            session.outcome = tracing::field::Empty,
            session.snapshots = tracing::field::Empty,
            session.chars = tracing::field::Empty,
            error.kind = tracing::field::Empty,
        );
        let join = tokio::spawn(
            run(self.inner.clone(), id, request, bearer, cancel.clone()).instrument(span),
        );

        Ok(SessionHandle {
            id,
            cancel,
            join,
            finished: None,
        })
    }

    /// Cancel `handle`'s session if it is the active one; otherwise a no-op.
    pub fn cancel(&self, handle: &SessionHandle) {
        let slot = self.inner.lock_slot();
        if slot.id == Some(handle.id)
            && slot.state.is_active()
            && let Some(token) = &slot.cancel
        {
            token.cancel();
        }
    }

    /// Documents attached to `message`, for display. Refs that no longer
    /// exist are skipped; other lookup failures are returned.
    pub async fn resolve_attachments(&self, message: &Message) -> CoreResult<Vec<Document>> {
        let Some(resolver) = &self.inner.settings.documents else {
            return Ok(Vec::new());
        };
        let mut docs = Vec::with_capacity(message.document_refs.len());
        for doc_ref in &message.document_refs {
            match resolver.resolve(doc_ref).await {
                Ok(doc) => docs.push(doc),
                Err(ChatStreamError::NotFound(what)) => {
                    tracing::debug!(%what, "attached document is gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(docs)
    }
}

impl Inner {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, update: SessionUpdate) {
        // A closed receiver just means nobody is watching.
        let _ = self.updates.send(update);
    }

    fn set_state(&self, id: SessionId, state: SessionState) {
        let mut slot = self.lock_slot();
        if slot.id == Some(id) {
            slot.state = state;
            if state.is_terminal() {
                slot.cancel = None;
            }
        }
    }
}

/// Moves the slot to `Failed` if the session task unwinds before reaching a
/// terminal state, so a panicking collaborator cannot wedge the controller.
struct ActiveGuard<'a> {
    inner: &'a Inner,
    id: SessionId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.inner.lock_slot();
        if slot.id != Some(self.id) || !slot.state.is_active() {
            return;
        }
        slot.state = SessionState::Failed;
        slot.cancel = None;
        drop(slot);
        tracing::error!(session = %self.id, "session task ended abnormally");
        self.inner.publish(SessionUpdate::Failed {
            session: self.id,
            failure: SessionFailure::internal("session task ended abnormally"),
        });
    }
}

enum Ending {
    Completed,
    Cancelled,
    Failed(ChatStreamError),
}

async fn run(
    inner: Arc<Inner>,
    id: SessionId,
    request: PromptRequest,
    bearer: SecretString,
    cancel: CancellationToken,
) -> SessionOutcome {
    let _guard = ActiveGuard { inner: &inner, id };
    let started = Instant::now();
    let mut assistant = Message::provisional_assistant(format!("{id}-assistant"));
    let mut applied: u32 = 0;
    let mut first_byte_ms = None;

    let submitted = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        res = inner.transport.submit_prompt(&request, &bearer) => Some(res),
    };

    let ending = match submitted {
        None => Ending::Cancelled,
        Some(Err(e)) => Ending::Failed(e),
        Some(Ok(body)) => {
            first_byte_ms = Some(started.elapsed().as_millis() as u64);
            inner.set_state(id, SessionState::Streaming);
            inner.publish(SessionUpdate::Message {
                session: id,
                state: SessionState::Streaming,
                message: assistant.clone(),
            });

            let events = Box::pin(EventStream::new(body));
            let mut snaps = snapshots(events, Accumulator::new(inner.settings.dialect));
            let ending = loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ending::Cancelled,
                    next = snaps.next() => next,
                };
                match next {
                    Some(Ok(snap)) => {
                        if assistant.apply_snapshot(&snap.text) {
                            applied += 1;
                            inner.publish(SessionUpdate::Message {
                                session: id,
                                state: SessionState::Streaming,
                                message: assistant.clone(),
                            });
                        }
                        if snap.terminal {
                            break Ending::Completed;
                        }
                    }
                    Some(Err(e)) => break Ending::Failed(e),
                    None => {
                        break Ending::Failed(ChatStreamError::IncompleteStream {
                            partial: assistant.content.clone(),
                        });
                    }
                }
            };
            // Closes the response body on every path.
            drop(snaps);
            ending
        }
    };
    drop(bearer);

    let span = tracing::Span::current();
    span.record(KEY_SNAPSHOTS, applied);
    span.record(KEY_CHARS, assistant.content.chars().count() as u64);
    let trace = SessionTrace::new(id.to_string(), inner.transport.name())
        .first_byte_ms(first_byte_ms)
        .latency_ms(started.elapsed().as_millis() as u64)
        .progress(applied, assistant.content.chars().count());

    match ending {
        Ending::Completed => {
            let msg = keep(&inner, id, SessionState::Completed, assistant);
            finish_span(&span, SessionState::Completed, None);
            telemetry::emit(trace.outcome(SessionState::Completed.as_str()));
            SessionOutcome::Completed(msg)
        }
        Ending::Cancelled => {
            let msg = keep(&inner, id, SessionState::Cancelled, assistant);
            finish_span(&span, SessionState::Cancelled, None);
            telemetry::emit(trace.outcome(SessionState::Cancelled.as_str()));
            SessionOutcome::Cancelled(msg)
        }
        Ending::Failed(err) => {
            let failure = SessionFailure::from(&err);
            inner.set_state(id, SessionState::Failed);
            inner.publish(SessionUpdate::Failed {
                session: id,
                failure: failure.clone(),
            });
            finish_span(&span, SessionState::Failed, Some(&err));
            tracing::warn!(error = %err, "session failed");
            telemetry::emit(
                trace
                    .outcome(SessionState::Failed.as_str())
                    .error(err.kind(), &err.to_string()),
            );
            SessionOutcome::Failed(failure)
        }
    }
}

/// Freeze the assistant message and append it to the conversation.
fn keep(inner: &Inner, id: SessionId, state: SessionState, mut assistant: Message) -> Message {
    assistant.freeze();
    // Append while still active so a new session cannot slip in ahead of it.
    inner.conversation.append_message(assistant.clone());
    inner.set_state(id, state);
    inner.publish(SessionUpdate::Message {
        session: id,
        state,
        message: assistant.clone(),
    });
    tracing::debug!(outcome = state.as_str(), chars = assistant.content.len(), "session ended");
    assistant
}

fn finish_span(span: &tracing::Span, state: SessionState, err: Option<&ChatStreamError>) {
    span.record(KEY_OUTCOME, state.as_str());
    if let Some(err) = err {
        span.record(KEY_ERROR_KIND, err.kind());
    }
}
