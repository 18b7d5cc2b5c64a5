//! Shared verifier helpers for pulling and asserting completion events.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rpccore::{
    CompletionEvent, CompletionQueue, EventKind, IncomingCall, Metadata, OpResult, QueueEvent,
    StatusCode, Tag,
};
use tokio::time::Instant;

pub fn within(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

pub fn within_millis(millis: u64) -> Instant {
    Instant::now() + Duration::from_millis(millis)
}

/// Pulls the next event, panicking on timeout or shutdown.
pub async fn next_event(cq: &Arc<CompletionQueue>) -> CompletionEvent {
    match cq.next(within(5)).await {
        QueueEvent::Complete(event) => event,
        other => panic!("expected a completion event, got {other:?}"),
    }
}

pub async fn expect_finish_accepted(cq: &Arc<CompletionQueue>, tag: u64) {
    let event = next_event(cq).await;
    assert_eq!(event.tag, Tag(tag));
    assert_eq!(event.result, OpResult::Ok);
    assert!(
        matches!(event.kind, EventKind::FinishAccepted),
        "expected FinishAccepted for tag {tag}, got {:?}",
        event.kind
    );
}

pub async fn expect_client_metadata_read(cq: &Arc<CompletionQueue>, tag: u64) -> Metadata {
    let event = next_event(cq).await;
    assert_eq!(event.tag, Tag(tag));
    assert_eq!(event.result, OpResult::Ok);
    match event.kind {
        EventKind::ClientMetadataRead(metadata) => metadata,
        other => panic!("expected ClientMetadataRead for tag {tag}, got {other:?}"),
    }
}

pub async fn expect_finished_with_status(
    cq: &Arc<CompletionQueue>,
    tag: u64,
    code: StatusCode,
    message: &str,
) {
    let event = next_event(cq).await;
    assert_eq!(event.tag, Tag(tag));
    match event.kind {
        EventKind::FinishedWithStatus(status) => {
            assert_eq!(status.code, code);
            assert_eq!(status.message, message);
        }
        other => panic!("expected FinishedWithStatus for tag {tag}, got {other:?}"),
    }
}

pub async fn expect_finished(cq: &Arc<CompletionQueue>, tag: u64) {
    let event = next_event(cq).await;
    assert_eq!(event.tag, Tag(tag));
    assert!(
        matches!(event.kind, EventKind::Finished),
        "expected Finished for tag {tag}, got {:?}",
        event.kind
    );
}

pub async fn expect_server_rpc_new(cq: &Arc<CompletionQueue>, tag: u64) -> IncomingCall {
    let event = next_event(cq).await;
    assert_eq!(event.tag, Tag(tag));
    assert_eq!(event.result, OpResult::Ok);
    match event.kind {
        EventKind::ServerRpcNew(incoming) => incoming,
        other => panic!("expected ServerRpcNew for tag {tag}, got {other:?}"),
    }
}

/// Asserts that nothing is delivered for a short window.
pub async fn expect_quiet(cq: &Arc<CompletionQueue>) {
    assert!(
        matches!(cq.next(within_millis(100)).await, QueueEvent::Timeout),
        "queue was expected to stay quiet"
    );
}

/// Pulls until the shutdown indicator arrives. The queue must already be
/// shutting down.
pub async fn drain(cq: &Arc<CompletionQueue>) {
    loop {
        match cq.next(within(5)).await {
            QueueEvent::Complete(_) => continue,
            QueueEvent::Shutdown => return,
            QueueEvent::Timeout => panic!("queue failed to drain"),
        }
    }
}
