//! Asynchronous RPC engine core.
//!
//! Multiplexes logical calls over a shared [`Connection`], bounded by a
//! negotiated `max_concurrent_streams` limit. Three pieces cooperate:
//!
//! - [`CompletionQueue`]: the blocking, tag-correlated event sink every
//!   asynchronous operation resolves through.
//! - [`Call`]: a per-RPC state machine on either the initiating or accepting
//!   side, validating each operation before it is issued.
//! - [`Connection`]: the stream admission controller, parking excess
//!   invocations in FIFO order and promoting them as active calls finish.
//!
//! Transport I/O, wire framing, and channel construction are external
//! collaborators; the core consumes method, authority, deadline, and status
//! as opaque values.

use thiserror::Error;

pub mod call;
pub mod completion;
pub mod config;
pub mod connection;
pub mod status;

pub use call::{Call, CallState, Role};
pub use completion::{
    CompletionEvent, CompletionQueue, EventKind, IncomingCall, OpResult, QueueEvent, Tag,
};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use status::{Metadata, Status, StatusCode};

#[derive(Debug, Error)]
pub enum RpcError {
    /// An operation was submitted in a state that does not permit it. The
    /// call itself is unaffected.
    #[error("Invalid call transition: {0}")]
    InvalidTransition(String),

    /// The owning completion queue is shutting down; no event was produced.
    #[error("Completion queue is shutting down")]
    QueueShutdown,

    /// The queue cannot be destroyed before its shutdown indicator has been
    /// observed.
    #[error("Completion queue has not observed shutdown")]
    QueueActive,

    #[error("Connection error: {0}")]
    ConnectionError(String),
}
