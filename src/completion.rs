use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::call::Call;
use crate::status::{Metadata, Status};
use crate::RpcError;

/// Opaque caller-chosen token correlating a submitted operation with its
/// eventual completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag({})", self.0)
    }
}

/// Result code carried by every completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    Error,
}

/// The acceptor-side call handed to the server by a `ServerRpcNew` event,
/// together with the routing details the initiator supplied.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call: Call,
    pub method: String,
    pub authority: String,
    pub deadline: Instant,
}

/// Payload-carrying event kind. Which kind a tag resolves with is fixed by
/// the operation that submitted it.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// An operation's network-visible effect has occurred (dispatch, flush,
    /// status write).
    FinishAccepted,
    /// The acceptor's initial metadata arrived at the initiator.
    ClientMetadataRead(Metadata),
    /// Terminal event on the initiator, carrying the acceptor's status
    /// verbatim.
    FinishedWithStatus(Status),
    /// Terminal event on the acceptor, armed by `server_accept`.
    Finished,
    /// A pending acceptance request was paired with an inbound call.
    ServerRpcNew(IncomingCall),
}

/// Immutable completion record, consumed exactly once.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub tag: Tag,
    pub result: OpResult,
    pub kind: EventKind,
}

/// Outcome of a single [`CompletionQueue::next`] pull.
#[derive(Debug)]
pub enum QueueEvent {
    Complete(CompletionEvent),
    /// The deadline elapsed before any event became available.
    Timeout,
    /// The queue has shut down and fully drained. Terminal and repeatable.
    Shutdown,
}

impl QueueEvent {
    /// Unwraps the completion event, panicking on `Timeout`/`Shutdown`.
    pub fn expect_complete(self) -> CompletionEvent {
        match self {
            QueueEvent::Complete(event) => event,
            other => panic!("expected a completion event, got {other:?}"),
        }
    }
}

struct QueueState {
    events: VecDeque<CompletionEvent>,
    in_flight: usize,
    shutting_down: bool,
    shutdown_observed: bool,
}

/// Thread-safe, blocking multi-producer/multi-consumer event sink.
///
/// Operations register themselves with [`submit`](Self::submit) and resolve
/// by pushing an event; any number of tasks may pull concurrently with
/// [`next`](Self::next). Events are delivered in push order across
/// producers; no ordering is guaranteed relative to submission order.
pub struct CompletionQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                in_flight: 0,
                shutting_down: false,
                shutdown_observed: false,
            }),
            wakeup: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers one in-flight operation that will eventually resolve under
    /// `tag`. Never blocks.
    pub fn submit(&self, tag: Tag) -> Result<(), RpcError> {
        self.submit_many(&[tag])
    }

    /// Registers several operations atomically: either all are accepted or
    /// the queue is shutting down and none are.
    pub(crate) fn submit_many(&self, tags: &[Tag]) -> Result<(), RpcError> {
        let mut state = self.lock();
        if state.shutting_down {
            return Err(RpcError::QueueShutdown);
        }
        state.in_flight += tags.len();
        debug!(count = tags.len(), in_flight = state.in_flight, "operations registered");
        Ok(())
    }

    /// Resolves a previously submitted operation, appending its event and
    /// waking one blocked consumer.
    ///
    /// Pushing against a queue that has already fully shut down is a
    /// programming error and is signaled rather than silently dropped.
    pub(crate) fn push(&self, tag: Tag, result: OpResult, kind: EventKind) -> Result<(), RpcError> {
        {
            let mut state = self.lock();
            if state.shutting_down && state.in_flight == 0 && state.events.is_empty() {
                return Err(RpcError::QueueShutdown);
            }
            state.in_flight = state.in_flight.saturating_sub(1);
            debug!(%tag, ?result, in_flight = state.in_flight, "completion event pushed");
            state.events.push_back(CompletionEvent { tag, result, kind });
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Like [`push`](Self::push) but logs instead of returning the error.
    /// Used on paths where the submitting side already holds an in-flight
    /// registration, so a failure here indicates an engine bug.
    pub(crate) fn post(&self, tag: Tag, result: OpResult, kind: EventKind) {
        if let Err(err) = self.push(tag, result, kind) {
            warn!(%tag, %err, "dropped completion event for a shut down queue");
        }
    }

    /// Pulls the oldest available event, waiting until `deadline` at most.
    ///
    /// Returns [`QueueEvent::Shutdown`] once the queue is shutting down and
    /// every previously submitted operation has resolved and drained;
    /// subsequent calls keep returning it immediately.
    pub async fn next(&self, deadline: Instant) -> QueueEvent {
        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        loop {
            // Register for a wakeup before inspecting state so a push or
            // shutdown between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(event) = state.events.pop_front() {
                    if state.shutting_down && state.in_flight == 0 && state.events.is_empty() {
                        // That was the last event; let the other waiters
                        // observe the terminal state.
                        self.wakeup.notify_waiters();
                    }
                    return QueueEvent::Complete(event);
                }
                if state.shutting_down && state.in_flight == 0 {
                    state.shutdown_observed = true;
                    return QueueEvent::Shutdown;
                }
            }
            if timeout_at(deadline, notified.as_mut()).await.is_err() {
                return QueueEvent::Timeout;
            }
            notified.set(self.wakeup.notified());
        }
    }

    /// Marks the queue as shutting down. The terminal indicator is delivered
    /// once all previously submitted operations have resolved and drained.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            debug!(
                in_flight = state.in_flight,
                buffered = state.events.len(),
                "completion queue shutting down"
            );
        }
        self.wakeup.notify_waiters();
    }

    /// Releases the queue. Fails unless a shutdown indicator has been
    /// observed by some consumer.
    pub fn destroy(&self) -> Result<(), RpcError> {
        let state = self.lock();
        if state.shutdown_observed {
            Ok(())
        } else {
            Err(RpcError::QueueActive)
        }
    }
}
