//! A single connection to a remote peer: the read loop that drives the
//! pipeline (framer, receiver, invoker or response settlement), the teardown
//! sequence, and the cheaply-clonable [`ConnectionHandle`] through which
//! callers raise notifications and make method calls of their own.
//!
//! This is the beating heart of both the client and server roles; under
//! JSON-RPC the two are peers and the machinery is identical.
//!
//! Exactly one task reads the input byte stream (the event loop in this
//! module) and exactly one task writes the output byte stream (the writer in
//! [`crate::outbound`]).  Handler bodies run on whatever scheduler the
//! options name, so the read loop never blocks on handler execution: a
//! request is admitted, scheduled, and forgotten until its task completes.
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use pin_project::pin_project;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::framing::FrameCodec;
use crate::invoker::{Invoker, InvokerOptions, SerialTicket, single_document_uri};
use crate::outbound::{WriteCommand, write_loop};
use crate::receiver::{self, InboundItem};
use crate::requests::PendingOutboundRequests;
use crate::router::Router;
use crate::{JsonRpcError, Result, error, types};

/// The notification method the invoker consumes itself; it never reaches
/// user handlers.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// The size of the mpsc channel that feeds the writer task.  After this many
/// messages are queued and not yet transmitted, backpressure is exerted on
/// the senders.
const CONNECTION_CHANNEL_BOUNDS: usize = 16;

/// The future used outside of this module to represent the running event loop servicing a
/// connection.
///
/// This is boxed and wrapped in [`futures::future::Shared`] to make it clonable, so every handle
/// to the connection can wait for a clean shutdown.
pub type ConnectionEventLoopFuture =
    futures::future::Shared<Pin<Box<dyn Future<Output = Result<(), String>> + Send>>>;

/// Options governing the lifecycle policies of a connection.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Cancel any request older than this, replying `RequestCancelled`.
    /// Unset means requests may run forever.
    pub maximum_request_timeout: Option<Duration>,

    /// When true, a notification from the content-modified trigger set
    /// abandons every in-flight request targeting the same document, replying
    /// `ContentModified` for each.
    pub supports_content_modified: bool,

    /// The notifications that count as mutating a document.
    pub content_modified_methods: Vec<types::Method>,

    /// Cap on simultaneously running handlers; requests beyond the cap queue
    /// FIFO.  `0` means unbounded.
    pub concurrency: usize,

    /// The scheduler handler tasks are spawned onto.  `None` uses the runtime
    /// the event loop itself runs on.
    pub scheduler: Option<tokio::runtime::Handle>,

    /// How long shutdown waits for in-flight handler tasks to finish and for
    /// the outbound queue to drain before abandoning them.
    pub graceful_shutdown_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            maximum_request_timeout: None,
            supports_content_modified: true,
            content_modified_methods: vec![
                "textDocument/didChange".into(),
                "textDocument/didClose".into(),
            ],
            concurrency: 0,
            scheduler: None,
            graceful_shutdown_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Attach the protocol engine to the two halves of a byte transport, returning the event loop
/// future and a handle to the new connection.
///
/// The caller is responsible for polling the returned future for the life of the connection; in
/// most cases it should be spawned into its own task with [`tokio::spawn`] or equivalent.  The
/// future resolves once the connection has fully torn down, with a string rendering of the fatal
/// error if there was one.
pub fn attach<R, W>(
    options: ConnectionOptions,
    router: Router,
    reader: R,
    writer: W,
) -> (ConnectionEventLoopFuture, ConnectionHandle)
where
    R: AsyncRead + Send + Sync + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    // Preserve the tracing context in the event loop
    let callers_span = tracing::Span::current();

    let cancellation_token = CancellationToken::new();
    let writer_stop = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(CONNECTION_CHANNEL_BOUNDS);

    let invoker = Arc::new(Invoker::new(InvokerOptions {
        maximum_request_timeout: options.maximum_request_timeout,
        concurrency: options.concurrency,
        scheduler: options.scheduler.clone(),
    }));
    let requests = Arc::new(PendingOutboundRequests::new());

    let event_loop_fut = {
        let cancellation_token = cancellation_token.clone();
        let writer_stop = writer_stop.clone();
        let outbound_tx = outbound_tx.clone();
        let invoker = invoker.clone();
        let requests = requests.clone();
        let drain_timeout = options.graceful_shutdown_timeout;

        async move {
            // The writer is its own task so slow handlers can never block a
            // reply that is already serialized, and vice versa
            let writer_task = tokio::spawn(
                write_loop(
                    writer,
                    outbound_rx,
                    writer_stop.clone(),
                    cancellation_token.clone(),
                    drain_timeout,
                )
                .in_current_span(),
            );

            let connection = Connection {
                options,
                router,
                invoker,
                requests,
                cancellation_token,
                writer_stop,
                outbound_tx,
                reader: FramedRead::new(reader, FrameCodec::new()),
                inbound_tasks: JoinSet::new(),
            };

            connection.event_loop(writer_task).await
        }
    };

    // Make the event loop future clonable so any handle can await shutdown.
    // The output has to be `Clone`, which rules out our error type, so the
    // error is flattened to its string rendering.  Panics in the loop are
    // caught too, so a handle waiting on the future always gets an answer.
    let event_loop_fut = async move {
        let result = AssertUnwindSafe(event_loop_fut).catch_unwind().await;
        match result {
            Ok(Ok(())) => Result::<(), String>::Ok(()),
            Ok(Err(e)) => Result::<(), String>::Err(e.to_string()),
            Err(e) => Result::<(), String>::Err(error::panic_err_to_string(e)),
        }
    }
    .instrument(callers_span)
    .boxed()
    .shared();

    let handle = ConnectionHandle {
        outbound_tx,
        requests,
        cancellation_token,
        event_loop_fut: event_loop_fut.clone(),
    };

    (event_loop_fut, handle)
}

struct Connection<R> {
    options: ConnectionOptions,
    router: Router,
    invoker: Arc<Invoker>,
    requests: Arc<PendingOutboundRequests>,
    cancellation_token: CancellationToken,
    writer_stop: CancellationToken,
    outbound_tx: mpsc::Sender<WriteCommand>,
    reader: FramedRead<R, FrameCodec>,

    /// Tasks servicing previously received requests and notifications.  When
    /// one completes and yields a reply, the event loop queues that reply for
    /// writing; replies therefore go out in completion order.
    inbound_tasks: JoinSet<Option<types::Message>>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Send + Sync + Unpin + 'static,
{
    async fn event_loop(mut self, writer_task: tokio::task::JoinHandle<()>) -> Result<()> {
        tracing::debug!("Connection event loop is starting");

        let result = loop {
            tokio::select! {
                frame = self.reader.next() => {
                    match frame {
                        Some(Ok(text)) => {
                            self.handle_inbound_text(text).await;
                        }
                        Some(Err(e)) => {
                            // Non-resynchronizable framing corruption or I/O
                            // failure; the connection cannot continue
                            tracing::error!(err = %e, "Fatal error reading from peer");
                            break Err(JsonRpcError::Transport { source: e });
                        }
                        None => {
                            tracing::debug!("Peer closed connection; event loop terminating");
                            break Ok(());
                        }
                    }
                },
                next = self.inbound_tasks.join_next(), if !self.inbound_tasks.is_empty() => {
                    if let Some(result) = next {
                        self.handle_task_completion(result).await;
                    }
                },
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("Cancellation signal received, shutting down connection");
                    break Err(JsonRpcError::Cancelled);
                }
            }
        };

        self.shutdown(writer_task, result).await
    }

    /// Orderly teardown: cancel whatever is still running, give it a bounded
    /// chance to wind down, drain the writer, and fail every caller still
    /// waiting on an outbound response.
    async fn shutdown(
        mut self,
        writer_task: tokio::task::JoinHandle<()>,
        result: Result<()>,
    ) -> Result<()> {
        // All per-request cancellation tokens are children of the connection
        // token, so this wakes every cooperative handler
        if !self.cancellation_token.is_cancelled() {
            tracing::debug!("Cancelling connection cancellation token after event loop exit");
            self.cancellation_token.cancel();
        }

        // Requests cancelled by shutdown get no reply
        tracing::debug!(
            num_inflight_requests = self.invoker.inflight_count(),
            num_pending_outbound_requests = self.requests.len(),
            "Cancelling in-flight requests for shutdown"
        );
        self.invoker.cancel_all();

        // Give in-flight handler tasks a chance to notice cancellation and
        // finish before forcibly aborting them
        {
            let deadline = self
                .options
                .graceful_shutdown_timeout
                .map(|timeout| tokio::time::Instant::now() + timeout);
            tracing::debug!(
                num_inbound_tasks = self.inbound_tasks.len(),
                graceful_shutdown_timeout = ?self.options.graceful_shutdown_timeout,
                "Waiting for in-flight handler tasks to complete"
            );

            let wind_down = loop {
                let next = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, self.inbound_tasks.join_next()).await {
                            Ok(next) => next,
                            Err(_) => break Err(()),
                        }
                    }
                    None => self.inbound_tasks.join_next().await,
                };
                match next {
                    Some(result) => self.handle_task_completion(result).await,
                    None => break Ok(()),
                }
            };

            if wind_down.is_err() {
                tracing::warn!(
                    num_inbound_tasks = self.inbound_tasks.len(),
                    "Timed out waiting for in-flight handler tasks; their async tasks will now be aborted"
                );
                self.inbound_tasks.abort_all();
                while let Some(result) = self.inbound_tasks.join_next().await {
                    self.handle_task_completion(result).await;
                }
            }
        }

        // Stop the writer, letting it drain anything already queued, and wait
        // for it to finish
        self.writer_stop.cancel();
        if let Err(e) = writer_task.await {
            tracing::error!(err = %e, "Writer task did not shut down cleanly");
        }

        // Anything still awaiting a response from the peer will never get one
        self.requests.fail_all();

        let (result, termination_reason) = match result {
            Err(JsonRpcError::Cancelled) => (Ok(()), "cancellation_token_triggered"),
            Err(e) => (Err(e), "error"),
            Ok(()) => (Ok(()), "remote_peer_closed_connection"),
        };

        tracing::debug!(termination_reason, "Event loop is exiting");
        result
    }

    /// Parse one frame's payload and dispatch whatever is in it.
    ///
    /// Parsing happens in two stages so the reply code matches the failure:
    /// text that isn't JSON at all is a `ParseError` with a null id, while
    /// valid JSON that isn't a valid envelope is an `InvalidRequest` carrying
    /// whatever id could be recovered.
    async fn handle_inbound_text(&mut self, text: String) {
        let value: JsonValue = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(err = %e, "Error parsing JSON message from peer");
                self.queue_reply(types::Message::Response(types::Response::error(
                    types::Id::Null,
                    types::ErrorCode::ParseError,
                    "Parse error",
                    None,
                )))
                .await;
                return;
            }
        };

        let recovered_id = receiver::recover_id(&value);
        let message = match types::Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(err = %e, "Inbound JSON is not a valid JSON-RPC envelope");
                self.queue_reply(types::Message::Response(types::Response::error(
                    recovered_id,
                    types::ErrorCode::InvalidRequest,
                    "Invalid request",
                    None,
                )))
                .await;
                return;
            }
        };

        let batch = match receiver::classify(message) {
            Ok(batch) => batch,
            Err(details) => {
                self.queue_reply(types::Message::Response(types::Response::error_detail(
                    types::Id::Null,
                    details,
                )))
                .await;
                return;
            }
        };

        if batch.has_response {
            tracing::trace!("Inbound batch contains responses to outbound requests");
        }

        for item in batch.items {
            match item {
                InboundItem::Response(response) => {
                    // Settled inline, on the input task, so observers see
                    // settlement in the order responses arrived
                    self.requests.settle(response);
                }
                InboundItem::Invalid(invalid_request) => {
                    self.queue_reply(types::Message::Response(types::Response::error(
                        invalid_request.id,
                        types::ErrorCode::InvalidRequest,
                        "Invalid request",
                        None,
                    )))
                    .await;
                }
                InboundItem::Notification(notification) => {
                    self.dispatch_notification(notification);
                }
                InboundItem::Request(request) => {
                    self.dispatch_request(request).await;
                }
            }
        }
    }

    /// Admit a request and schedule its handler.  Never waits on the handler
    /// itself.
    async fn dispatch_request(&mut self, request: types::Request) {
        let span = tracing::debug_span!("inbound_request",
            method = %request.method,
            request_id = %request.id);

        let Some(descriptor) = self.router.lookup_request(&request.method) else {
            tracing::debug!(parent: &span, "No handler registered for method");
            self.queue_reply(types::Message::Response(types::Response::error(
                request.id,
                types::ErrorCode::MethodNotFound,
                format!("Unknown method '{}'", request.method),
                None,
            )))
            .await;
            return;
        };

        let record = match self.invoker.admit(&request, &self.cancellation_token) {
            Ok(record) => record,
            Err(details) => {
                // Deliberately anchored to no id: the id in question already
                // belongs to a pending request that will produce its own reply
                self.queue_reply(types::Message::Response(types::Response::error_detail(
                    types::Id::Null,
                    details,
                )))
                .await;
                return;
            }
        };

        // Serial-group position is claimed here, on the input task, so group
        // ordering matches on-the-wire ordering
        let ticket = descriptor
            .serial_group()
            .map(|group| self.invoker.serial_ticket(group));

        let invoker = self.invoker.clone();
        self.spawn_inbound_task(
            invoker
                .run_request(descriptor, request, record, ticket)
                .instrument(span),
        );
    }

    /// Route one inbound notification.  `$/cancelRequest` and the
    /// content-modified sweep are handled here, inline on the input task, so
    /// they happen-before any dispatch the loop does afterwards.
    fn dispatch_notification(&mut self, notification: types::Notification) {
        if notification.method == CANCEL_REQUEST_METHOD {
            self.handle_cancel_request(&notification);
            return;
        }

        if self.options.supports_content_modified
            && self.options.content_modified_methods.contains(&notification.method)
        {
            match single_document_uri(notification.params.as_ref()) {
                Some(uri) => self.invoker.cancel_for_document(&uri),
                None => {
                    tracing::debug!(method = %notification.method,
                        "Content-modified trigger notification carries no document URI; \
                         no in-flight requests are abandoned");
                }
            }
        }

        let descriptors = self.router.lookup_notifications(&notification.method);
        if descriptors.is_empty() {
            tracing::debug!(method = %notification.method,
                "No handler registered for notification; dropping it");
            return;
        }

        // One serial ticket for the implicit per-method queue, keeping
        // notifications of one method in wire order, plus one per distinct
        // explicit group any fan-out descriptor belongs to
        let mut keys: Vec<&str> = vec![notification.method.as_str()];
        for descriptor in &descriptors {
            if let Some(group) = descriptor.serial_group() {
                if !keys.contains(&group) {
                    keys.push(group);
                }
            }
        }
        let tickets: Vec<SerialTicket> = keys.iter().map(|key| self.invoker.serial_ticket(key)).collect();

        let span = tracing::debug_span!("inbound_notification", method = %notification.method);
        let token = self.cancellation_token.child_token();
        let invoker = self.invoker.clone();
        self.spawn_inbound_task(
            invoker
                .run_notification(descriptors, notification, tickets, token)
                .instrument(span),
        );
    }

    /// Consume a `$/cancelRequest` notification.  Processing is synchronous
    /// with the read loop: a cancel immediately following a request cannot
    /// race with that request's queuing.
    fn handle_cancel_request(&self, notification: &types::Notification) {
        let id = notification
            .params
            .as_ref()
            .and_then(|params| params.get("id"))
            .cloned()
            .and_then(|id| serde_json::from_value::<types::Id>(id).ok());

        match id {
            Some(id) => self.invoker.cancel_peer_request(&id),
            None => {
                tracing::warn!("$/cancelRequest notification with missing or malformed id; ignoring");
            }
        }
    }

    fn spawn_inbound_task<F>(&mut self, future: F)
    where
        F: Future<Output = Option<types::Message>> + Send + 'static,
    {
        match &self.options.scheduler {
            Some(handle) => {
                self.inbound_tasks.spawn_on(future, handle);
            }
            None => {
                self.inbound_tasks.spawn(future);
            }
        }
    }

    /// A task servicing an earlier inbound message has finished; write its
    /// reply if it produced one.
    async fn handle_task_completion(
        &mut self,
        result: Result<Option<types::Message>, tokio::task::JoinError>,
    ) {
        match result {
            Ok(Some(message)) => {
                self.queue_reply(message).await;
            }
            Ok(None) => {
                // Notification, or a request whose terminal event forbids a reply
            }
            Err(join_err) => {
                // The task panicked or was aborted.  Handler panics are caught
                // one level down and already produced an InternalError reply,
                // so this is the supervising task itself dying.  Don't let it
                // kill the event loop.
                tracing::error!(join_err = %join_err,
                    "JoinError prevented handling of an inbound message");
            }
        }
    }

    async fn queue_reply(&self, message: types::Message) {
        if self
            .outbound_tx
            .send(WriteCommand::fire_and_forget(message))
            .await
            .is_err()
        {
            // The writer has failed; it has already cancelled the connection
            // token, so the event loop is on its way down
            tracing::debug!("Dropping outbound message because the writer task has stopped");
        }
    }
}

/// Lightweight and cheaply-clonable handle to a connection and its associated background task.
///
/// This handle is used to send notifications and method call requests to the remote peer at the
/// other end of the connection.  It is also able to signal the connection to shut down.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound_tx: mpsc::Sender<WriteCommand>,
    requests: Arc<PendingOutboundRequests>,
    cancellation_token: CancellationToken,
    event_loop_fut: ConnectionEventLoopFuture,
}

impl ConnectionHandle {
    /// Signal the connection cancellation token to shut down the event loop, and wait until the
    /// event loop background task has finished running.
    ///
    /// Any pending outgoing requests produce immediate connection-lost errors.  Any in-flight
    /// inbound requests are signalled for cancellation; unless their handlers check the token
    /// they keep running detached, with their results discarded.  The graceful shutdown timeout
    /// from [`ConnectionOptions`] bounds how long teardown waits for them.
    ///
    /// The result is the result of the event loop itself; either way, once this returns the
    /// event loop has stopped.
    pub async fn shutdown(self) -> Result<(), String> {
        self.cancellation_token.cancel();
        self.event_loop_fut.await
    }

    /// Send a request to invoke a method without any parameters, awaiting a response.
    pub async fn call<Resp>(&self, method: impl Into<types::Method>) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        self.start_call(method).await?.await
    }

    /// Send a request to invoke a method with parameters, awaiting a response.
    pub async fn call_with_params<Req, Resp>(
        &self,
        method: impl Into<types::Method>,
        params: Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.start_call_with_params(method, params).await?.await
    }

    /// Start a method call without parameters and immediately return a request handle without
    /// waiting for a response from the remote peer.
    ///
    /// The [`RequestHandle`] can be awaited for the response, or used to cancel the request or
    /// learn its assigned id.
    pub async fn start_call<Resp>(&self, method: impl Into<types::Method>) -> Result<RequestHandle<Resp>>
    where
        Resp: DeserializeOwned,
    {
        self.start_call_raw(method, None).await
    }

    /// Start a method call with parameters and immediately return a request handle without
    /// waiting for a response from the remote peer.
    pub async fn start_call_with_params<Req, Resp>(
        &self,
        method: impl Into<types::Method>,
        params: Req,
    ) -> Result<RequestHandle<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| JsonRpcError::SerRequest {
            source: e,
            type_name: std::any::type_name::<Req>(),
        })?;

        self.start_call_raw(method, Some(params)).await
    }

    /// Initiate an outbound method call request with optional raw JSON params.
    ///
    /// This is the basis for all method call functions.  The request id comes from the
    /// connection's monotone counter, and the waiter is registered before the frame is queued so
    /// even an instant response finds it.
    async fn start_call_raw<Resp>(
        &self,
        method: impl Into<types::Method>,
        params: Option<JsonValue>,
    ) -> Result<RequestHandle<Resp>>
    where
        Resp: DeserializeOwned,
    {
        let method = method.into();
        let request_id = self.requests.next_request_id();
        let request = types::Request::new(request_id.clone(), method.clone(), params);

        let (response_tx, response_rx) = oneshot::channel();
        self.requests.register(request_id.clone(), response_tx);

        if self
            .outbound_tx
            .send(WriteCommand::fire_and_forget(types::Message::Request(request)))
            .await
            .is_err()
        {
            // The writer is gone, so the connection is closed; take the waiter
            // back out before reporting failure
            self.requests.cancel(&request_id);
            tracing::debug!(
                %request_id,
                "Outbound channel closed when trying to send method call; connection is presumably \
                 closed or shutting down"
            );
            return Err(JsonRpcError::PendingRequestConnectionClosed);
        }

        Ok(RequestHandle {
            receiver: response_rx,
            request_id,
            method,
            handle: self.clone(),
            _type: PhantomData,
        })
    }

    /// Send a notification to the remote peer, without any parameters, neither expecting nor
    /// waiting for a response.
    ///
    /// A successful completion merely means the notification was written to the transport; there
    /// is no way to know how the remote peer processed it, if at all.
    pub async fn raise(&self, method: impl Into<types::Method>) -> Result<()> {
        self.raise_raw(method, None).await
    }

    /// Send a notification to the remote peer, including some notification arguments.
    pub async fn raise_with_params<Req>(&self, method: impl Into<types::Method>, params: Req) -> Result<()>
    where
        Req: Serialize,
    {
        self.raise_raw(
            method,
            serde_json::to_value(params).map_err(|e| JsonRpcError::SerRequest {
                source: e,
                type_name: std::any::type_name::<Req>(),
            })?,
        )
        .await
    }

    /// Raw version of [`Self::raise`] operating directly on JSON values.
    pub async fn raise_raw(
        &self,
        method: impl Into<types::Method>,
        params: impl Into<Option<JsonValue>>,
    ) -> Result<()> {
        let (command, sent_rx) = WriteCommand::confirmed(types::Message::Notification(
            types::Notification::new(method, params.into()),
        ));

        if self.outbound_tx.send(command).await.is_err() {
            tracing::debug!(
                "Outbound channel closed when trying to send notification; connection is \
                 presumably closed or shutting down"
            );
            return Err(JsonRpcError::PendingRequestConnectionClosed);
        }

        match sent_rx.await {
            Ok(result) => result,
            Err(_) => {
                // The writer dropped the confirmation channel without
                // answering, which only happens if it died mid-write
                Err(JsonRpcError::PendingRequestConnectionClosed)
            }
        }
    }
}

/// Handle to an outbound JSON-RPC method call request expected to produce a response of type `T`.
///
/// Implements [`Future`], so awaiting it yields the response.  It also allows cancelling the
/// request and exposes the request id the connection assigned, which is what the peer needs to
/// correlate things like progress or cancellation.
#[pin_project]
pub struct RequestHandle<T> {
    #[pin]
    receiver: oneshot::Receiver<Result<types::Response>>,
    request_id: types::Id,
    method: types::Method,
    handle: ConnectionHandle,
    _type: PhantomData<T>,
}

impl<T> RequestHandle<T>
where
    T: DeserializeOwned,
{
    /// The request ID assigned to this outstanding request.
    pub fn request_id(&self) -> types::Id {
        self.request_id.clone()
    }

    /// Cancel this request.
    ///
    /// The local promise settles immediately with a cancellation error, and any response the
    /// peer eventually sends is discarded since it no longer matches a known outstanding id.  A
    /// `$/cancelRequest` notification is also sent, best-effort, so a cooperating peer can stop
    /// doing the work.
    pub async fn cancel(self) {
        if self.handle.requests.cancel(&self.request_id) {
            tracing::debug!(request_id = %self.request_id, "Cancelling pending outbound request");
            let _ = self
                .handle
                .raise_raw(
                    CANCEL_REQUEST_METHOD,
                    serde_json::json!({ "id": self.request_id }),
                )
                .await;
        } else {
            tracing::debug!(request_id = %self.request_id,
                "Tried to cancel an outbound request that has already settled");
        }
    }
}

impl<T> Future for RequestHandle<T>
where
    T: DeserializeOwned,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match futures::ready!(this.receiver.poll(cx)) {
            Ok(Ok(response)) => match response.payload {
                types::ResponsePayload::Success(success) => {
                    Poll::Ready(serde_json::from_value(success.result.clone()).map_err(|e| {
                        JsonRpcError::DeserResponse {
                            source: e,
                            type_name: std::any::type_name::<T>(),
                            response: success.result,
                        }
                    }))
                }
                types::ResponsePayload::Error(error_response) => Poll::Ready(Err(JsonRpcError::MethodError {
                    method: this.method.clone(),
                    error: error_response.error,
                })),
            },
            Ok(Err(e)) => Poll::Ready(Err(e)),
            Err(_) => {
                // The sender side of the one-shot channel was dropped.  That shouldn't happen
                // absent a panic in the event loop, since teardown drains pending requests
                tracing::error!(
                    request_id = %this.request_id,
                    "BUG: One-shot channel was dropped before the connection could settle the request"
                );
                Poll::Ready(Err(JsonRpcError::PendingRequestConnectionClosed))
            }
        }
    }
}
