use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::completion::{CompletionQueue, EventKind, OpResult, Tag};
use crate::connection::ConnectionInner;
use crate::status::{Metadata, Status};
use crate::RpcError;

/// Which side of the RPC this call lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Per-call lifecycle state. The initiator moves through
/// `Created -> Invoked -> (MetadataRead) -> WritesDoneSent -> Finished`,
/// the acceptor through
/// `PendingAdmission -> Accepted -> MetadataSent -> Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    Invoked,
    MetadataRead,
    WritesDoneSent,
    PendingAdmission,
    Accepted,
    MetadataSent,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOp {
    Invoke,
    WritesDone,
    ServerAccept,
    ServerEndInitialMetadata,
    StartWriteStatus,
}

/// Single source of truth for legal transitions. Returns the successor
/// state, or `None` when the operation is not permitted from `state`.
pub(crate) fn next_state(role: Role, state: CallState, op: CallOp) -> Option<CallState> {
    use CallOp::*;
    use CallState::*;
    use Role::*;

    match (role, state, op) {
        (Initiator, Created, Invoke) => Some(Invoked),
        (Initiator, Invoked, WritesDone) | (Initiator, MetadataRead, WritesDone) => {
            Some(WritesDoneSent)
        }
        (Acceptor, PendingAdmission, ServerAccept) => Some(Accepted),
        (Acceptor, Accepted, ServerEndInitialMetadata) => Some(MetadataSent),
        (Acceptor, MetadataSent, StartWriteStatus) => Some(Finished),
        // Half-closing the acceptor side ends payload writes without
        // changing its headline state.
        (Acceptor, Accepted, WritesDone) | (Acceptor, MetadataSent, WritesDone) => Some(state),
        _ => None,
    }
}

fn transition_error(op: &str, role: Role, state: CallState) -> RpcError {
    RpcError::InvalidTransition(format!(
        "{op} not permitted for {role:?} call in state {state:?}"
    ))
}

struct CallCtx {
    state: CallState,
    cq: Option<Arc<CompletionQueue>>,
    /// Initiator: resolves when the acceptor's initial metadata arrives.
    metadata_read_tag: Option<Tag>,
    /// Initiator: terminal `FinishedWithStatus`. Acceptor: terminal
    /// `Finished`, armed by `server_accept`.
    finished_tag: Option<Tag>,
    /// A `writes_done` issued while parked by admission; flushed when the
    /// call is admitted.
    deferred_writes_done: Option<Tag>,
    /// Initiator: the call holds an active slot on its connection.
    admitted: bool,
    peer: Option<Call>,
    deadline_timer: Option<JoinHandle<()>>,
    ops_submitted: bool,
}

pub(crate) struct CallInner {
    id: u64,
    role: Role,
    method: String,
    authority: String,
    deadline: Instant,
    conn: Weak<ConnectionInner>,
    ctx: Mutex<CallCtx>,
}

impl CallInner {
    fn lock_ctx(&self) -> MutexGuard<'_, CallCtx> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One logical RPC on either side of a connection. Cheap to clone; all
/// clones refer to the same call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("method", &self.inner.method)
            .finish_non_exhaustive()
    }
}

impl Call {
    fn new(
        id: u64,
        role: Role,
        state: CallState,
        method: String,
        authority: String,
        deadline: Instant,
        conn: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id,
                role,
                method,
                authority,
                deadline,
                conn,
                ctx: Mutex::new(CallCtx {
                    state,
                    cq: None,
                    metadata_read_tag: None,
                    finished_tag: None,
                    deferred_writes_done: None,
                    admitted: false,
                    peer: None,
                    deadline_timer: None,
                    ops_submitted: false,
                }),
            }),
        }
    }

    pub(crate) fn new_initiator(
        id: u64,
        method: String,
        authority: String,
        deadline: Instant,
        conn: Weak<ConnectionInner>,
    ) -> Self {
        Self::new(id, Role::Initiator, CallState::Created, method, authority, deadline, conn)
    }

    pub(crate) fn new_acceptor(
        id: u64,
        method: String,
        authority: String,
        deadline: Instant,
        conn: Weak<ConnectionInner>,
    ) -> Self {
        Self::new(
            id,
            Role::Acceptor,
            CallState::PendingAdmission,
            method,
            authority,
            deadline,
            conn,
        )
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    pub fn state(&self) -> CallState {
        self.inner.lock_ctx().state
    }

    /// Begins the call (initiator only, from `Created`).
    ///
    /// Dispatch is acknowledged immediately with `FinishAccepted` under
    /// `invoke_tag`, whether or not admission then parks the call.
    /// `metadata_read_tag` resolves when the acceptor sends its initial
    /// metadata; `finished_tag` resolves with the terminal
    /// `FinishedWithStatus`. Must be called from within a Tokio runtime:
    /// the call's deadline timer is spawned here.
    pub fn invoke(
        &self,
        cq: &Arc<CompletionQueue>,
        invoke_tag: Tag,
        metadata_read_tag: Tag,
        finished_tag: Tag,
    ) -> Result<(), RpcError> {
        let conn = self
            .inner
            .conn
            .upgrade()
            .ok_or_else(|| RpcError::ConnectionError("connection dropped".into()))?;
        if conn.is_closed() {
            return Err(RpcError::ConnectionError("connection closed".into()));
        }
        {
            let mut ctx = self.inner.lock_ctx();
            let next = next_state(self.inner.role, ctx.state, CallOp::Invoke)
                .ok_or_else(|| transition_error("invoke", self.inner.role, ctx.state))?;
            cq.submit_many(&[invoke_tag, metadata_read_tag, finished_tag])?;
            ctx.state = next;
            ctx.cq = Some(cq.clone());
            ctx.metadata_read_tag = Some(metadata_read_tag);
            ctx.finished_tag = Some(finished_tag);
            ctx.ops_submitted = true;
            ctx.deadline_timer = Some(spawn_deadline_timer(self.clone()));
        }
        debug!(call = self.inner.id, method = %self.inner.method, "call invoked");
        cq.post(invoke_tag, OpResult::Ok, EventKind::FinishAccepted);
        conn.register_invoked(self.clone());
        Ok(())
    }

    /// Signals that no more payload writes will follow. On the initiator the
    /// completion is deferred until the call is admitted; an already-active
    /// call (either role) completes immediately.
    pub fn writes_done(&self, tag: Tag) -> Result<(), RpcError> {
        let cq = {
            let mut ctx = self.inner.lock_ctx();
            let next = next_state(self.inner.role, ctx.state, CallOp::WritesDone)
                .ok_or_else(|| transition_error("writes_done", self.inner.role, ctx.state))?;
            let cq = match &ctx.cq {
                Some(cq) => cq.clone(),
                None => return Err(transition_error("writes_done", self.inner.role, ctx.state)),
            };
            cq.submit(tag)?;
            ctx.state = next;
            ctx.ops_submitted = true;
            if self.inner.role == Role::Initiator && !ctx.admitted {
                ctx.deferred_writes_done = Some(tag);
                debug!(call = self.inner.id, %tag, "writes_done parked until admission");
                return Ok(());
            }
            cq
        };
        cq.post(tag, OpResult::Ok, EventKind::FinishAccepted);
        Ok(())
    }

    /// Completes acceptance bookkeeping (acceptor only) and arms the
    /// acceptor-side terminal `Finished` event under `finished_tag`.
    pub fn server_accept(
        &self,
        cq: &Arc<CompletionQueue>,
        finished_tag: Tag,
    ) -> Result<(), RpcError> {
        let mut ctx = self.inner.lock_ctx();
        let next = next_state(self.inner.role, ctx.state, CallOp::ServerAccept)
            .ok_or_else(|| transition_error("server_accept", self.inner.role, ctx.state))?;
        cq.submit(finished_tag)?;
        ctx.state = next;
        ctx.cq = Some(cq.clone());
        ctx.finished_tag = Some(finished_tag);
        ctx.ops_submitted = true;
        debug!(call = self.inner.id, "call accepted");
        Ok(())
    }

    /// Sends the response headers (acceptor only). Fires the initiator's
    /// paired `ClientMetadataRead` event with `metadata`, possibly empty.
    pub fn server_end_initial_metadata(&self, metadata: Metadata) -> Result<(), RpcError> {
        let peer = {
            let mut ctx = self.inner.lock_ctx();
            let next = next_state(self.inner.role, ctx.state, CallOp::ServerEndInitialMetadata)
                .ok_or_else(|| {
                    transition_error("server_end_initial_metadata", self.inner.role, ctx.state)
                })?;
            ctx.state = next;
            ctx.ops_submitted = true;
            ctx.peer.clone()
        };
        match peer {
            Some(peer) => peer.deliver_initial_metadata(metadata),
            None => warn!(call = self.inner.id, "acceptor call has no paired initiator"),
        }
        Ok(())
    }

    /// Sends the terminal status (acceptor only). Completes `tag` with
    /// `FinishAccepted`, fires the acceptor's armed `Finished` event, then
    /// finishes the initiator with the byte-identical status. Releases the
    /// call's admission slot, which may admit the next pending call.
    pub fn start_write_status(&self, status: Status, tag: Tag) -> Result<(), RpcError> {
        let (cq, finished_tag, peer) = {
            let mut ctx = self.inner.lock_ctx();
            let next = next_state(self.inner.role, ctx.state, CallOp::StartWriteStatus)
                .ok_or_else(|| {
                    transition_error("start_write_status", self.inner.role, ctx.state)
                })?;
            let cq = match &ctx.cq {
                Some(cq) => cq.clone(),
                None => {
                    return Err(transition_error(
                        "start_write_status",
                        self.inner.role,
                        ctx.state,
                    ))
                }
            };
            cq.submit(tag)?;
            ctx.state = next;
            (cq, ctx.finished_tag.take(), ctx.peer.clone())
        };
        debug!(call = self.inner.id, code = %status.code, "status written, call finished");
        cq.post(tag, OpResult::Ok, EventKind::FinishAccepted);
        if let Some(finished_tag) = finished_tag {
            cq.post(finished_tag, OpResult::Ok, EventKind::Finished);
        }
        match peer {
            Some(peer) => peer.finish_with_status(status, OpResult::Ok),
            None => warn!(call = self.inner.id, "acceptor call has no paired initiator"),
        }
        Ok(())
    }

    /// Releases the call. Legal from `Finished`, or before any operation has
    /// been submitted.
    pub fn destroy(&self) -> Result<(), RpcError> {
        let mut ctx = self.inner.lock_ctx();
        match ctx.state {
            CallState::Finished => {
                if let Some(timer) = ctx.deadline_timer.take() {
                    timer.abort();
                }
                Ok(())
            }
            CallState::Created | CallState::PendingAdmission if !ctx.ops_submitted => Ok(()),
            state => Err(transition_error("destroy", self.inner.role, state)),
        }
    }

    /// Pairs this parked initiator with a freshly created acceptor call.
    /// Returns `false` if the call already finished (deadline raced the
    /// admission).
    ///
    /// Any deferred `writes_done` is flushed while the call lock is still
    /// held: a concurrently expiring deadline must take that lock before it
    /// can post the terminal event, so the flush can never land behind it.
    pub(crate) fn admit(&self, server: Call) -> bool {
        {
            let mut ctx = self.inner.lock_ctx();
            if ctx.state == CallState::Finished {
                return false;
            }
            ctx.admitted = true;
            ctx.peer = Some(server.clone());
            if let Some(tag) = ctx.deferred_writes_done.take() {
                if let Some(cq) = &ctx.cq {
                    cq.post(tag, OpResult::Ok, EventKind::FinishAccepted);
                }
            }
        }
        server.set_peer(self.clone());
        debug!(call = self.inner.id, server = server.inner.id, "call admitted");
        true
    }

    pub(crate) fn set_peer(&self, peer: Call) {
        self.inner.lock_ctx().peer = Some(peer);
    }

    /// Fires the initiator's metadata-read event, moving `Invoked` to
    /// `MetadataRead`; a call already past `WritesDoneSent` keeps its state.
    fn deliver_initial_metadata(&self, metadata: Metadata) {
        let (cq, tag) = {
            let mut ctx = self.inner.lock_ctx();
            if ctx.state == CallState::Invoked {
                ctx.state = CallState::MetadataRead;
            }
            let tag = match ctx.metadata_read_tag.take() {
                Some(tag) => tag,
                None => return,
            };
            let cq = match ctx.cq.clone() {
                Some(cq) => cq,
                None => return,
            };
            (cq, tag)
        };
        cq.post(tag, OpResult::Ok, EventKind::ClientMetadataRead(metadata));
    }

    /// Transitions the initiator to `Finished` exactly once, resolving every
    /// still-outstanding tag. Outstanding non-terminal operations resolve
    /// with a failure result; the terminal event carries `status` and
    /// `result`. Releases the admission slot if this call held one.
    pub(crate) fn finish_with_status(&self, status: Status, result: OpResult) {
        let parts = {
            let mut ctx = self.inner.lock_ctx();
            if ctx.state == CallState::Finished {
                None
            } else {
                ctx.state = CallState::Finished;
                if let Some(timer) = ctx.deadline_timer.take() {
                    timer.abort();
                }
                let cq = ctx.cq.clone();
                Some((
                    cq,
                    ctx.deferred_writes_done.take(),
                    ctx.metadata_read_tag.take(),
                    ctx.finished_tag.take(),
                    ctx.admitted,
                ))
            }
        };
        let Some((cq, deferred, metadata_read, finished, admitted)) = parts else {
            return;
        };
        if let Some(cq) = cq {
            if let Some(tag) = deferred {
                cq.post(tag, OpResult::Error, EventKind::FinishAccepted);
            }
            if let Some(tag) = metadata_read {
                cq.post(
                    tag,
                    OpResult::Error,
                    EventKind::ClientMetadataRead(Metadata::new()),
                );
            }
            if let Some(tag) = finished {
                cq.post(tag, result, EventKind::FinishedWithStatus(status));
            }
        }
        if admitted {
            if let Some(conn) = self.inner.conn.upgrade() {
                conn.release_slot();
            }
        }
    }

    /// Terminates the acceptor side abnormally (deadline or cancellation):
    /// no status is written, the armed `Finished` event resolves with a
    /// failure result.
    fn finish_acceptor_abnormal(&self) {
        let parts = {
            let mut ctx = self.inner.lock_ctx();
            if ctx.state == CallState::Finished {
                None
            } else {
                ctx.state = CallState::Finished;
                Some((ctx.cq.clone(), ctx.finished_tag.take()))
            }
        };
        if let Some((Some(cq), Some(tag))) = parts {
            cq.post(tag, OpResult::Error, EventKind::Finished);
        }
    }

    /// Deadline handler: unilaterally finishes the pair with a
    /// deadline-exceeded status.
    pub(crate) fn expire(&self) {
        let (peer, admitted) = {
            let ctx = self.inner.lock_ctx();
            if ctx.state == CallState::Finished {
                return;
            }
            (ctx.peer.clone(), ctx.admitted)
        };
        warn!(call = self.inner.id, method = %self.inner.method, "call deadline exceeded");
        if !admitted {
            if let Some(conn) = self.inner.conn.upgrade() {
                conn.remove_pending(self.inner.id);
            }
        }
        self.finish_with_status(Status::deadline_exceeded(), OpResult::Error);
        if let Some(peer) = peer {
            peer.finish_acceptor_abnormal();
        }
    }

    /// Cancels a parked call when its connection closes.
    pub(crate) fn cancel(&self, status: Status) {
        self.finish_with_status(status, OpResult::Error);
    }
}

fn spawn_deadline_timer(call: Call) -> JoinHandle<()> {
    let deadline = call.inner.deadline;
    tokio::spawn(async move {
        sleep_until(deadline).await;
        call.expire();
    })
}
