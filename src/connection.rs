use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::call::{Call, CallState};
use crate::completion::{CompletionQueue, EventKind, IncomingCall, OpResult, Tag};
use crate::config::ConnectionConfig;
use crate::status::Status;
use crate::RpcError;

struct AcceptRequest {
    cq: Arc<CompletionQueue>,
    tag: Tag,
}

struct ConnState {
    /// Invoked initiator calls awaiting pairing, strictly in arrival order.
    pending: VecDeque<Call>,
    /// Outstanding acceptance requests, strictly in registration order.
    requests: VecDeque<AcceptRequest>,
    /// Number of admitted, unfinished call pairs.
    active: usize,
    peak_active: usize,
    closed: bool,
}

pub(crate) struct ConnectionInner {
    self_ref: Weak<ConnectionInner>,
    config: ConnectionConfig,
    next_call_id: AtomicU64,
    state: Mutex<ConnState>,
}

/// The shared context both sides of the engine operate against. Owns the
/// stream admission controller: active calls are bounded by the configured
/// `max_concurrent_streams`, and excess invocations park in a FIFO pending
/// queue until a slot frees up.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let inner = Arc::new_cyclic(|self_ref| ConnectionInner {
            self_ref: self_ref.clone(),
            config,
            next_call_id: AtomicU64::new(1),
            state: Mutex::new(ConnState {
                pending: VecDeque::new(),
                requests: VecDeque::new(),
                active: 0,
                peak_active: 0,
                closed: false,
            }),
        });
        Self { inner }
    }

    /// Creates an initiator-side call in `Created`. No admission or queue
    /// interaction happens until `invoke`.
    pub fn create_call(
        &self,
        method: impl Into<String>,
        authority: impl Into<String>,
        deadline: Instant,
    ) -> Call {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        Call::new_initiator(
            id,
            method.into(),
            authority.into(),
            deadline,
            self.inner.self_ref.clone(),
        )
    }

    /// Registers the acceptor side's interest in the next inbound call.
    ///
    /// When an invoked call and a free slot are both available, the oldest
    /// request is paired with the oldest eligible call and `tag` resolves
    /// with a `ServerRpcNew` event carrying the new acceptor-side call.
    pub fn request_call(&self, cq: &Arc<CompletionQueue>, tag: Tag) -> Result<(), RpcError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(RpcError::ConnectionError("connection closed".into()));
        }
        cq.submit(tag)?;
        state.requests.push_back(AcceptRequest { cq: cq.clone(), tag });
        self.inner.pump(&mut state);
        Ok(())
    }

    /// Number of currently admitted, unfinished call pairs.
    pub fn active_calls(&self) -> usize {
        self.inner.lock_state().active
    }

    /// High-water mark of concurrently active call pairs.
    pub fn peak_active(&self) -> usize {
        self.inner.lock_state().peak_active
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.inner.config.max_concurrent_streams()
    }

    /// Closes the connection: outstanding acceptance requests resolve with a
    /// failure result, parked calls are cancelled, and new invocations or
    /// requests are rejected. Already-active calls may still run to
    /// completion.
    pub fn close(&self) {
        let (requests, parked) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.requests),
                std::mem::take(&mut state.pending),
            )
        };
        debug!(
            requests = requests.len(),
            parked = parked.len(),
            "connection closed"
        );
        for request in requests {
            request
                .cq
                .post(request.tag, OpResult::Error, EventKind::Finished);
        }
        for call in parked {
            call.cancel(Status::cancelled("connection closed"));
        }
    }
}

impl ConnectionInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Queues a freshly invoked initiator call for admission.
    pub(crate) fn register_invoked(&self, call: Call) {
        let mut state = self.lock_state();
        if state.closed {
            // The call's own deadline timer will fail it.
            warn!(call = call.id(), "invoke on closed connection, call will not be admitted");
            return;
        }
        if call.state() == CallState::Finished {
            // The deadline elapsed before registration; every tag has
            // already resolved.
            debug!(call = call.id(), "expired before registration, not queued");
            return;
        }
        state.pending.push_back(call);
        self.pump(&mut state);
    }

    /// Returns an admission slot and immediately tries to promote the next
    /// pending call.
    pub(crate) fn release_slot(&self) {
        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);
        self.pump(&mut state);
    }

    /// Drops a parked call that expired before being admitted.
    pub(crate) fn remove_pending(&self, id: u64) {
        let mut state = self.lock_state();
        state.pending.retain(|call| call.id() != id);
    }

    /// Admits pending calls while a slot, an eligible call, and an
    /// acceptance request are all available. FIFO on both sides.
    fn pump(&self, state: &mut ConnState) {
        loop {
            let capacity = match self.config.max_concurrent_streams() {
                Some(limit) => state.active < limit as usize,
                None => true,
            };
            if !capacity || state.requests.is_empty() {
                break;
            }
            let Some(client) = state.pending.pop_front() else {
                break;
            };
            let server = Call::new_acceptor(
                self.next_call_id.fetch_add(1, Ordering::Relaxed),
                client.method().to_string(),
                client.authority().to_string(),
                client.deadline(),
                self.self_ref.clone(),
            );
            if !client.admit(server.clone()) {
                // Lost the race against the call's deadline; the request
                // stays at the head of the line.
                continue;
            }
            let Some(request) = state.requests.pop_front() else {
                break;
            };
            state.active += 1;
            state.peak_active = state.peak_active.max(state.active);
            debug!(
                method = client.method(),
                active = state.active,
                "inbound call admitted"
            );
            request.cq.post(
                request.tag,
                OpResult::Ok,
                EventKind::ServerRpcNew(IncomingCall {
                    call: server,
                    method: client.method().to_string(),
                    authority: client.authority().to_string(),
                    deadline: client.deadline(),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::QueueEvent;
    use crate::status::{Metadata, StatusCode};
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn next_tag(cq: &Arc<CompletionQueue>) -> Tag {
        cq.next(soon()).await.expect_complete().tag
    }

    fn setup(limit: u32) -> (Connection, Arc<CompletionQueue>, Arc<CompletionQueue>) {
        let conn = Connection::new(ConnectionConfig::new().with_max_concurrent_streams(limit));
        (
            conn,
            Arc::new(CompletionQueue::new()),
            Arc::new(CompletionQueue::new()),
        )
    }

    fn finish(server: &Call, server_cq: &Arc<CompletionQueue>, accept_tag: Tag, status_tag: Tag) {
        server.server_accept(server_cq, accept_tag).unwrap();
        server
            .server_end_initial_metadata(Metadata::new())
            .unwrap();
        server
            .start_write_status(Status::new(StatusCode::Unimplemented, "xyz"), status_tag)
            .unwrap();
    }

    #[tokio::test]
    async fn admission_respects_limit() {
        let (conn, client_cq, server_cq) = setup(1);
        conn.request_call(&server_cq, Tag(100)).unwrap();
        conn.request_call(&server_cq, Tag(200)).unwrap();

        let a = conn.create_call("/a", "test", soon());
        let b = conn.create_call("/b", "test", soon());
        a.invoke(&client_cq, Tag(1), Tag(2), Tag(3)).unwrap();
        b.invoke(&client_cq, Tag(11), Tag(12), Tag(13)).unwrap();

        // Only the first call is paired even though two requests are queued.
        let incoming = server_cq.next(soon()).await.expect_complete();
        assert_eq!(incoming.tag, Tag(100));
        assert_eq!(conn.active_calls(), 1);
        let near = Instant::now() + Duration::from_millis(50);
        assert!(matches!(server_cq.next(near).await, QueueEvent::Timeout));
    }

    #[tokio::test]
    async fn fifo_promotion_across_three_calls() {
        let (conn, client_cq, server_cq) = setup(1);
        let methods = ["/alpha", "/beta", "/gamma"];
        let calls: Vec<Call> = methods
            .iter()
            .map(|method| conn.create_call(*method, "test", soon()))
            .collect();
        for (index, call) in calls.iter().enumerate() {
            let base = 10 * (index as u64 + 1);
            call.invoke(&client_cq, Tag(base), Tag(base + 1), Tag(base + 2))
                .unwrap();
        }

        for (index, expected) in methods.iter().enumerate() {
            let tag = Tag(100 + index as u64);
            conn.request_call(&server_cq, tag).unwrap();
            let event = server_cq.next(soon()).await.expect_complete();
            assert_eq!(event.tag, tag);
            let EventKind::ServerRpcNew(incoming) = event.kind else {
                panic!("expected ServerRpcNew, got {:?}", event.kind);
            };
            assert_eq!(incoming.method, *expected);
            assert_eq!(conn.active_calls(), 1);
            finish(&incoming.call, &server_cq, Tag(500 + index as u64), Tag(600 + index as u64));
            assert_eq!(conn.active_calls(), 0);
        }
        assert_eq!(conn.peak_active(), 1);
    }

    #[tokio::test]
    async fn zero_limit_never_admits() {
        let (conn, client_cq, server_cq) = setup(0);
        conn.request_call(&server_cq, Tag(100)).unwrap();
        let call = conn.create_call("/a", "test", soon());
        call.invoke(&client_cq, Tag(1), Tag(2), Tag(3)).unwrap();

        let near = Instant::now() + Duration::from_millis(100);
        assert!(matches!(server_cq.next(near).await, QueueEvent::Timeout));
        assert_eq!(conn.active_calls(), 0);
        assert_eq!(conn.peak_active(), 0);
    }

    #[tokio::test]
    async fn close_fails_requests_and_parked_calls() {
        let (conn, client_cq, server_cq) = setup(1);
        conn.request_call(&server_cq, Tag(100)).unwrap();
        conn.close();

        let event = server_cq.next(soon()).await.expect_complete();
        assert_eq!(event.tag, Tag(100));
        assert_eq!(event.result, OpResult::Error);
        assert!(matches!(event.kind, EventKind::Finished));

        let call = conn.create_call("/a", "test", soon());
        let err = call.invoke(&client_cq, Tag(1), Tag(2), Tag(3));
        assert!(matches!(err, Err(RpcError::ConnectionError(_))));
        assert!(matches!(
            conn.request_call(&server_cq, Tag(101)),
            Err(RpcError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn close_cancels_parked_calls() {
        let (conn, client_cq, _server_cq) = setup(1);
        let call = conn.create_call("/a", "test", soon());
        call.invoke(&client_cq, Tag(1), Tag(2), Tag(3)).unwrap();
        assert_eq!(next_tag(&client_cq).await, Tag(1));

        conn.close();

        // Metadata read resolves with a failure, then the terminal status.
        let event = client_cq.next(soon()).await.expect_complete();
        assert_eq!(event.tag, Tag(2));
        assert_eq!(event.result, OpResult::Error);
        let event = client_cq.next(soon()).await.expect_complete();
        assert_eq!(event.tag, Tag(3));
        assert_eq!(event.result, OpResult::Error);
        let EventKind::FinishedWithStatus(status) = event.kind else {
            panic!("expected FinishedWithStatus, got {:?}", event.kind);
        };
        assert_eq!(status.code, StatusCode::Cancelled);
    }

    #[tokio::test]
    async fn finished_calls_are_never_queued_for_admission() {
        let (conn, client_cq, _server_cq) = setup(1);
        let call = conn.create_call("/dead", "test", soon());
        call.invoke(&client_cq, Tag(1), Tag(2), Tag(3)).unwrap();
        call.expire();
        assert!(conn.inner.lock_state().pending.is_empty());

        // Registering after expiry is a no-op; no dead entry may linger in
        // the pending queue.
        conn.inner.register_invoked(call.clone());
        assert!(conn.inner.lock_state().pending.is_empty());
    }

    #[tokio::test]
    async fn unbounded_connection_admits_everything() {
        let (conn, client_cq, server_cq) = setup_unbounded();
        for index in 0..4u64 {
            conn.request_call(&server_cq, Tag(100 + index)).unwrap();
            let call = conn.create_call("/m", "test", soon());
            call.invoke(&client_cq, Tag(index * 10), Tag(index * 10 + 1), Tag(index * 10 + 2))
                .unwrap();
        }
        for _ in 0..4 {
            let event = server_cq.next(soon()).await.expect_complete();
            assert!(matches!(event.kind, EventKind::ServerRpcNew(_)));
        }
        assert_eq!(conn.active_calls(), 4);
        assert_eq!(conn.peak_active(), 4);
    }

    fn setup_unbounded() -> (Connection, Arc<CompletionQueue>, Arc<CompletionQueue>) {
        let conn = Connection::new(ConnectionConfig::new());
        (
            conn,
            Arc::new(CompletionQueue::new()),
            Arc::new(CompletionQueue::new()),
        )
    }
}
