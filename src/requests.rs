//! The pending-outbound-request table, matching inbound responses to the
//! callers awaiting them.
//!
//! Outbound request ids are integers from a strictly-monotone per-connection
//! counter, so an id can never be reused against a stale waiter.  Each entry
//! owns the oneshot sender for exactly one caller; the caller holds only the
//! receiving end, so settlement happens exactly once no matter which path
//! (response, cancellation, connection loss) gets there first.
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::{JsonRpcError, Result, types};

/// Map between a request ID that was sent to the remote peer and the one-shot channel to which
/// the eventual response from the remote peer to that request should be sent.
pub(crate) struct PendingOutboundRequests {
    next_id: AtomicU64,
    pending: Mutex<HashMap<types::Id, oneshot::Sender<Result<types::Response>>>>,
}

impl PendingOutboundRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next outbound request id.
    pub(crate) fn next_request_id(&self) -> types::Id {
        types::Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a waiter for `id`.  Must happen before the request frame is
    /// queued for writing, or a fast peer could respond into a void.
    pub(crate) fn register(&self, id: types::Id, response_tx: oneshot::Sender<Result<types::Response>>) {
        let previous = self.pending.lock().unwrap().insert(id, response_tx);
        debug_assert!(previous.is_none(), "BUG: outbound request id reused");
    }

    /// Route an inbound response to its waiter.
    ///
    /// A response whose id is not in the table is discarded; the usual causes
    /// are a request that was cancelled locally before the response arrived,
    /// or a peer that is simply confused.
    pub(crate) fn settle(&self, response: types::Response) {
        let waiter = self.pending.lock().unwrap().remove(&response.id);
        match waiter {
            Some(tx) => {
                // Send fails only if the caller stopped waiting; nothing to do then
                let _ = tx.send(Ok(response));
            }
            None => {
                tracing::debug!(request_id = %response.id,
                    "Discarding response for unknown request ID.  \
                     Perhaps this request was previously cancelled.");
            }
        }
    }

    /// Settle a pending request locally with a cancellation error.  Returns
    /// true if there was still a waiter to settle.
    pub(crate) fn cancel(&self, id: &types::Id) -> bool {
        match self.pending.lock().unwrap().remove(id) {
            Some(tx) => {
                let _ = tx.send(Err(JsonRpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// The connection is gone; everything still pending fails with
    /// connection-lost.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.is_empty() {
            tracing::debug!(
                num_pending_outbound_requests = pending.len(),
                "Responding with an error to all pending outbound requests"
            );
        }
        for (id, tx) in pending.drain() {
            tracing::debug!(request_id = %id,
                "Responding to pending outbound request with error due to shutdown");
            let _ = tx.send(Err(JsonRpcError::PendingRequestConnectionClosed));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Id, Response};
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn ids_are_strictly_monotone_integers() {
        let requests = PendingOutboundRequests::new();
        let ids: Vec<_> = (0..5).map(|_| requests.next_request_id()).collect();
        assert_eq!(
            ids,
            vec![
                Id::Number(1),
                Id::Number(2),
                Id::Number(3),
                Id::Number(4),
                Id::Number(5)
            ]
        );
    }

    #[tokio::test]
    async fn settles_matching_response() {
        let requests = PendingOutboundRequests::new();
        let id = requests.next_request_id();
        let (tx, rx) = oneshot::channel();
        requests.register(id.clone(), tx);

        requests.settle(Response::success(id, json!("done")));

        let result = rx.await.unwrap().unwrap();
        assert_matches!(result.payload, types::ResponsePayload::Success(s) if s.result == json!("done"));
        assert_eq!(requests.len(), 0);
    }

    #[tokio::test]
    async fn unknown_response_is_silently_discarded() {
        let requests = PendingOutboundRequests::new();
        let (tx, mut rx) = oneshot::channel();
        requests.register(Id::Number(1), tx);

        // A response for an id we never issued must not disturb the table
        requests.settle(Response::success(Id::Number(999), json!(null)));
        assert_eq!(requests.len(), 1);
        assert_matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn response_after_local_cancel_is_discarded() {
        let requests = PendingOutboundRequests::new();
        let (tx, rx) = oneshot::channel();
        requests.register(Id::Number(1), tx);

        assert!(requests.cancel(&Id::Number(1)));
        assert_matches!(rx.await.unwrap(), Err(JsonRpcError::Cancelled));

        // The late response finds no waiter
        requests.settle(Response::success(Id::Number(1), json!("late")));
        assert!(!requests.cancel(&Id::Number(1)));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_pending_promise() {
        let requests = PendingOutboundRequests::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        requests.register(Id::Number(1), tx1);
        requests.register(Id::Number(2), tx2);

        requests.fail_all();

        assert_matches!(rx1.await.unwrap(), Err(JsonRpcError::PendingRequestConnectionClosed));
        assert_matches!(rx2.await.unwrap(), Err(JsonRpcError::PendingRequestConnectionClosed));
        assert_eq!(requests.len(), 0);
    }
}
