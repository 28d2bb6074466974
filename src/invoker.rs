//! Execution of inbound requests and notifications under the lifecycle
//! policies: peer cancellation, content-modified abandonment, timeout,
//! shutdown, serial-group ordering, and the global concurrency cap.
//!
//! Every inbound request gets an [`InflightRequest`] record in the invoker's
//! in-flight table for exactly as long as the handler has neither produced a
//! result nor been observed cancelled.  The record's terminal state is a
//! single atomic: whichever event (completion or one of the cancel sources)
//! wins the compare-and-swap decides the one reply that goes on the wire.
//! Everything else keys off that, so duplicate replies are impossible by
//! construction.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::handler::Invocation;
use crate::router::HandlerDescriptor;
use crate::types;

/// The cancellation sources that can terminate an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelKind {
    /// The peer sent `$/cancelRequest` for this id
    PeerRequest,
    /// A document this request was computed against was mutated
    ContentModified,
    /// The request outlived the configured maximum request timeout
    Timeout,
    /// The connection is shutting down
    Shutdown,
}

// Request lifecycle states.  Queued and Running are transient; everything
// else is terminal and transitions are a single CAS.
const STATE_QUEUED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_COMPLETED: u8 = 2;
const STATE_CANCELLED_PEER: u8 = 3;
const STATE_CANCELLED_CONTENT_MODIFIED: u8 = 4;
const STATE_CANCELLED_TIMEOUT: u8 = 5;
const STATE_CANCELLED_SHUTDOWN: u8 = 6;

fn cancel_state(kind: CancelKind) -> u8 {
    match kind {
        CancelKind::PeerRequest => STATE_CANCELLED_PEER,
        CancelKind::ContentModified => STATE_CANCELLED_CONTENT_MODIFIED,
        CancelKind::Timeout => STATE_CANCELLED_TIMEOUT,
        CancelKind::Shutdown => STATE_CANCELLED_SHUTDOWN,
    }
}

/// Tracking record for one in-flight inbound request.
///
/// Exists in the invoker's table from receipt until a terminal event; the
/// invocation task removes it when it emits (or deliberately omits) the reply.
#[derive(Debug)]
pub(crate) struct InflightRequest {
    pub(crate) id: types::Id,
    pub(crate) method: types::Method,
    /// The single document URI this request targets, when its params expose
    /// one.  Requests with no URI (or more than one) are unaffected by
    /// content-modified cancellation.
    pub(crate) document_uri: Option<String>,
    state: AtomicU8,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) started_at: tokio::time::Instant,
}

impl InflightRequest {
    fn new(request: &types::Request, cancellation_token: CancellationToken) -> Self {
        Self {
            id: request.id.clone(),
            method: request.method.clone(),
            document_uri: single_document_uri(request.params.as_ref()),
            state: AtomicU8::new(STATE_QUEUED),
            cancellation_token,
            started_at: tokio::time::Instant::now(),
        }
    }

    /// Try to move this request into a cancelled terminal state.
    ///
    /// Returns true if this call won the transition.  Whether or not it did,
    /// the cancellation token ends up signalled, so late cancel sources are
    /// coalesced rather than producing duplicate replies.
    pub(crate) fn try_cancel(&self, kind: CancelKind) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                STATE_QUEUED | STATE_RUNNING => Some(cancel_state(kind)),
                _ => None,
            })
            .is_ok();

        if won {
            self.cancellation_token.cancel();
        }
        won
    }

    /// Try to move this request into the completed terminal state.  Returns
    /// false if some cancel source beat the handler to it, in which case the
    /// handler's result must be discarded.
    fn try_complete(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                STATE_QUEUED | STATE_RUNNING => Some(STATE_COMPLETED),
                _ => None,
            })
            .is_ok()
    }

    fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(STATE_QUEUED, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Which cancel source won, if the request is in a cancelled terminal state.
    fn cancel_kind(&self) -> Option<CancelKind> {
        match self.state.load(Ordering::Acquire) {
            STATE_CANCELLED_PEER => Some(CancelKind::PeerRequest),
            STATE_CANCELLED_CONTENT_MODIFIED => Some(CancelKind::ContentModified),
            STATE_CANCELLED_TIMEOUT => Some(CancelKind::Timeout),
            STATE_CANCELLED_SHUTDOWN => Some(CancelKind::Shutdown),
            _ => None,
        }
    }
}

/// Extract `params.textDocument.uri` when it is present and a string.
pub(crate) fn single_document_uri(params: Option<&types::JsonValue>) -> Option<String> {
    params?
        .get("textDocument")?
        .get("uri")?
        .as_str()
        .map(str::to_string)
}

/// FIFO position in a serial group, claimed on the input task at dispatch
/// time so ordering matches on-the-wire order exactly.
///
/// The invocation waits on `predecessor` before running, and releases its
/// successor by dropping `_done` when it finishes, whether it completed or
/// was cancelled.
pub(crate) struct SerialTicket {
    pub(crate) predecessor: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

/// Tuning knobs for the invoker, split out of the connection options.
pub(crate) struct InvokerOptions {
    pub maximum_request_timeout: Option<Duration>,
    pub concurrency: usize,
    pub scheduler: Option<tokio::runtime::Handle>,
}

/// Schedules and supervises handler execution for one connection.
///
/// The in-flight table is the only hot shared structure; it lives behind a
/// plain mutex whose critical sections are single map operations.
pub(crate) struct Invoker {
    inflight: Mutex<HashMap<types::Id, Arc<InflightRequest>>>,
    /// Tail of each serial group: the `done` receiver the next joiner waits on.
    /// Keys are explicit serial group names plus the implicit per-method
    /// groups used to keep notifications in wire order.  The map is bounded
    /// by the number of distinct groups, so entries are never reaped.
    serial_tails: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    /// Global cap on concurrently running handlers; `None` means unbounded.
    concurrency: Option<Arc<Semaphore>>,
    maximum_request_timeout: Option<Duration>,
    scheduler: Option<tokio::runtime::Handle>,
}

impl Invoker {
    pub(crate) fn new(options: InvokerOptions) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            serial_tails: Mutex::new(HashMap::new()),
            concurrency: match options.concurrency {
                0 => None,
                n => Some(Arc::new(Semaphore::new(n))),
            },
            maximum_request_timeout: options.maximum_request_timeout,
            scheduler: options.scheduler,
        }
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Admit a new inbound request into the in-flight table.
    ///
    /// Request ids must be unique per direction for the life of the
    /// connection, so a duplicate is rejected without disturbing the request
    /// already pending under that id.  The reply for the rejection carries no
    /// id, exactly like any other unanchorable invalid message.
    pub(crate) fn admit(
        &self,
        request: &types::Request,
        parent_token: &CancellationToken,
    ) -> Result<Arc<InflightRequest>, types::ErrorDetails> {
        let record = Arc::new(InflightRequest::new(request, parent_token.child_token()));

        let mut inflight = self.inflight.lock().unwrap();
        if inflight.contains_key(&request.id) {
            tracing::error!(request_id = %request.id,
                method = %request.method,
                "Remote peer sent a duplicate request ID!");
            return Err(types::ErrorDetails::invalid_request(
                "Duplicate request ID",
                Some(serde_json::json!({
                    "duplicated_request_id": request.id,
                    "method": request.method,
                })),
            ));
        }
        inflight.insert(request.id.clone(), record.clone());
        Ok(record)
    }

    fn remove(&self, id: &types::Id) {
        self.inflight.lock().unwrap().remove(id);
    }

    /// Cancel an in-flight request at the peer's behest.  A cancel for an id
    /// that isn't in flight (never seen, already finished, or not yet
    /// received) is deliberately dropped; there is no retroactive queue.
    pub(crate) fn cancel_peer_request(&self, id: &types::Id) {
        let record = self.inflight.lock().unwrap().get(id).cloned();
        match record {
            Some(record) => {
                if record.try_cancel(CancelKind::PeerRequest) {
                    tracing::debug!(request_id = %id, "Peer cancelled in-flight request");
                } else {
                    tracing::debug!(request_id = %id,
                        "Peer cancel arrived after the request already reached a terminal state");
                }
            }
            None => {
                tracing::debug!(request_id = %id, "Dropping $/cancelRequest for unknown request ID");
            }
        }
    }

    /// Cancel every in-flight request computed against `uri`.  The replies
    /// will carry `ContentModified` so the peer knows the results went stale
    /// rather than failed.
    pub(crate) fn cancel_for_document(&self, uri: &str) {
        let matching: Vec<_> = self
            .inflight
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.document_uri.as_deref() == Some(uri))
            .cloned()
            .collect();

        for record in matching {
            if record.try_cancel(CancelKind::ContentModified) {
                tracing::debug!(request_id = %record.id,
                    method = %record.method,
                    uri,
                    "Abandoning in-flight request because its document was modified");
            }
        }
    }

    /// Cancel everything; used at connection shutdown.  No replies are emitted
    /// for requests cancelled this way.
    pub(crate) fn cancel_all(&self) {
        let all: Vec<_> = self.inflight.lock().unwrap().values().cloned().collect();
        for record in all {
            record.try_cancel(CancelKind::Shutdown);
        }
    }

    /// Claim the next FIFO position in a serial group.  Must be called on the
    /// input task, in dispatch order, for the group ordering guarantee to
    /// mean anything.
    pub(crate) fn serial_ticket(&self, group: &str) -> SerialTicket {
        let (done_tx, done_rx) = oneshot::channel();
        let predecessor = self.serial_tails.lock().unwrap().insert(group.to_string(), done_rx);
        SerialTicket {
            predecessor,
            _done: done_tx,
        }
    }

    /// Spawn a future onto the configured handler scheduler, detached.
    fn spawn_handler<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.scheduler {
            Some(handle) => handle.spawn(future.in_current_span()),
            None => tokio::spawn(future.in_current_span()),
        }
    }

    /// Drive one inbound request through the policy pipeline to its single
    /// reply.  Returns `None` only when the winning terminal event was a
    /// shutdown, which emits no reply.
    ///
    /// Runs as its own task; the connection event loop writes whatever this
    /// returns.
    pub(crate) async fn run_request(
        self: Arc<Self>,
        descriptor: Arc<HandlerDescriptor>,
        request: types::Request,
        record: Arc<InflightRequest>,
        ticket: Option<SerialTicket>,
    ) -> Option<types::Message> {
        let id = record.id.clone();
        let reply = self.run_request_inner(descriptor, request, &record, ticket).await;
        // Terminal state reached one way or another; the handle leaves the table
        self.remove(&id);
        reply
    }

    async fn run_request_inner(
        &self,
        descriptor: Arc<HandlerDescriptor>,
        request: types::Request,
        record: &InflightRequest,
        mut ticket: Option<SerialTicket>,
    ) -> Option<types::Message> {
        let token = record.cancellation_token.clone();
        let deadline = self.maximum_request_timeout.map(|timeout| record.started_at + timeout);

        // Serial-group predecessors first.  A closed channel means the
        // predecessor is done regardless of how it ended, so the Err is as
        // good as an Ok here.
        if let Some(predecessor) = ticket.as_mut().and_then(|t| t.predecessor.take()) {
            match gate(predecessor, &token, deadline).await {
                Gate::Ready(_) => {}
                Gate::Cancelled => return self.cancelled_reply(record),
                Gate::TimedOut => return self.timeout_reply(record),
            }
        }

        // Then a slot under the global concurrency cap.  Cancellation of a
        // queued request is immediate and the handler body is never invoked.
        let _permit = match &self.concurrency {
            Some(semaphore) => match gate(semaphore.clone().acquire_owned(), &token, deadline).await {
                Gate::Ready(Ok(permit)) => Some(permit),
                Gate::Ready(Err(_)) => {
                    // The semaphore is never closed, so this can't happen
                    tracing::error!("BUG: concurrency semaphore closed while connection is live");
                    return self.cancelled_reply(record);
                }
                Gate::Cancelled => return self.cancelled_reply(record),
                Gate::TimedOut => return self.timeout_reply(record),
            },
            None => None,
        };

        if !record.mark_running() {
            // Cancelled in the window between the last gate and here
            return self.cancelled_reply(record);
        }

        // The handler body runs as its own task so that a handler which
        // ignores its cancellation token keeps running harmlessly after we
        // have already replied; dropping the join handle discards its result.
        let invocation = Invocation::from_request(request, token.clone());
        let handler = descriptor.handler.clone();
        let handler_task = self.spawn_handler(async move { handler.handle(invocation).await });

        match gate(handler_task, &token, deadline).await {
            Gate::Ready(Ok(payload)) => {
                if record.try_complete() {
                    if payload.is_error() {
                        tracing::debug!(request_id = %record.id,
                            method = %record.method,
                            "Request handler returned an error payload");
                    }
                    Some(types::Message::Response(types::Response::new(
                        record.id.clone(),
                        payload,
                    )))
                } else {
                    // A cancel source won while the handler was finishing up
                    self.cancelled_reply(record)
                }
            }
            Gate::Ready(Err(join_err)) => {
                if record.try_complete() {
                    tracing::error!(request_id = %record.id,
                        method = %record.method,
                        join_err = %join_err,
                        "Request handler task panicked");
                    Some(types::Message::Response(types::Response::error(
                        record.id.clone(),
                        types::ErrorCode::InternalError,
                        "Internal error in request handler",
                        None,
                    )))
                } else {
                    self.cancelled_reply(record)
                }
            }
            Gate::Cancelled => self.cancelled_reply(record),
            Gate::TimedOut => self.timeout_reply(record),
        }
    }

    /// Build the reply for a request whose cancellation token fired, using
    /// whichever cancel source won the terminal transition.
    fn cancelled_reply(&self, record: &InflightRequest) -> Option<types::Message> {
        // If the token fired without a terminal CAS, the connection-level
        // parent token was cancelled directly; fold that into shutdown
        record.try_cancel(CancelKind::Shutdown);

        match record.cancel_kind() {
            Some(CancelKind::PeerRequest) => Some(types::Message::Response(types::Response::error(
                record.id.clone(),
                types::ErrorCode::RequestCancelled,
                "Request cancelled",
                None,
            ))),
            Some(CancelKind::Timeout) => Some(types::Message::Response(types::Response::error(
                record.id.clone(),
                types::ErrorCode::RequestCancelled,
                "Request timed out",
                None,
            ))),
            Some(CancelKind::ContentModified) => Some(types::Message::Response(types::Response::error(
                record.id.clone(),
                types::ErrorCode::ContentModified,
                "Content modified",
                None,
            ))),
            Some(CancelKind::Shutdown) => None,
            None => {
                // Terminal state is Completed but we took a cancellation
                // path; cannot happen given the CAS ordering
                tracing::error!(request_id = %record.id,
                    "BUG: cancellation path taken for a completed request");
                None
            }
        }
    }

    fn timeout_reply(&self, record: &InflightRequest) -> Option<types::Message> {
        record.try_cancel(CancelKind::Timeout);
        // Some other source may have won the race; reply with whatever did
        self.cancelled_reply(record)
    }

    /// Run all matching notification handlers for one inbound notification,
    /// in registration order.  Failures are logged and never produce a reply.
    pub(crate) async fn run_notification(
        self: Arc<Self>,
        descriptors: Vec<Arc<HandlerDescriptor>>,
        notification: types::Notification,
        mut tickets: Vec<SerialTicket>,
        token: CancellationToken,
    ) -> Option<types::Message> {
        // Wait for every serial predecessor (the implicit per-method group
        // plus any explicit groups the descriptors belong to)
        for ticket in &mut tickets {
            if let Some(predecessor) = ticket.predecessor.take() {
                match gate(predecessor, &token, None).await {
                    Gate::Ready(_) => {}
                    Gate::Cancelled | Gate::TimedOut => return None,
                }
            }
        }

        for descriptor in descriptors {
            let invocation = Invocation::from_notification(notification.clone(), token.clone());
            let payload = descriptor.handler.handle(invocation).await;
            if let types::ResponsePayload::Error(error) = payload {
                tracing::warn!(method = %notification.method,
                    code = %error.error.code,
                    message = %error.error.message,
                    "Notification handler failed; notifications get no reply so the error ends here");
            }
        }

        None
    }
}

/// Outcome of waiting on one stage of the policy pipeline.
enum Gate<T> {
    Ready(T),
    Cancelled,
    TimedOut,
}

/// Await `future`, racing it against the request's cancellation token and
/// optional deadline.  Cancellation wins ties so a cancel that has already
/// fired never loses to a result that became ready in the same poll.
async fn gate<F: std::future::Future>(
    future: F,
    token: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> Gate<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Gate::Cancelled,
        _ = sleep_until_or_forever(deadline) => Gate::TimedOut,
        output = future => Gate::Ready(output),
    }
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
