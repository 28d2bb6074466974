//! The single-writer output side of a connection.
//!
//! Every outbound frame, whether a reply produced by a handler or a request
//! or notification raised through a connection handle, funnels through one
//! mpsc queue into one task that owns the write half of the transport.  That
//! makes write ordering FIFO by construction and keeps frame boundaries
//! atomic, since nothing else ever touches the sink.
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::framing::FrameCodec;
use crate::{JsonRpcError, Result, types};

/// One unit of work for the writer task.
pub(crate) struct WriteCommand {
    pub message: types::Message,
    /// When present, receives confirmation that the frame was handed to the
    /// transport (or the error that prevented it).
    pub sent_tx: Option<oneshot::Sender<Result<()>>>,
}

impl WriteCommand {
    pub(crate) fn fire_and_forget(message: types::Message) -> Self {
        Self {
            message,
            sent_tx: None,
        }
    }

    pub(crate) fn confirmed(message: types::Message) -> (Self, oneshot::Receiver<Result<()>>) {
        let (sent_tx, sent_rx) = oneshot::channel();
        (
            Self {
                message,
                sent_tx: Some(sent_tx),
            },
            sent_rx,
        )
    }
}

/// The writer task.
///
/// Runs until stopped or until the sink fails.  Stopping is signalled through
/// `stop` (idempotent, it is just a token); the queue is then drained up to
/// `drain_timeout` before the sink is closed.  A sink failure cancels
/// `connection_token` so the rest of the connection tears down too, and every
/// queued command from then on fails instead of being written.
pub(crate) async fn write_loop<W>(
    writer: W,
    mut commands: mpsc::Receiver<WriteCommand>,
    stop: CancellationToken,
    connection_token: CancellationToken,
    drain_timeout: Option<Duration>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        if !write_one(&mut sink, command).await {
                            // The sink is broken; nothing further can be sent.
                            // Bring the whole connection down with us.
                            connection_token.cancel();
                            fail_remaining(&mut commands).await;
                            return;
                        }
                    }
                    None => {
                        // Every sender is gone, which shouldn't happen while the
                        // connection event loop holds one.  Treat as a stop.
                        tracing::debug!("Outbound command channel closed; writer exiting");
                        break;
                    }
                }
            }
            _ = stop.cancelled() => {
                drain(&mut sink, &mut commands, drain_timeout).await;
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(err = %e, "Error closing outbound sink");
    }
}

/// Serialize and write one frame.  Returns false when the sink has failed.
async fn write_one<W>(sink: &mut FramedWrite<W, FrameCodec>, command: WriteCommand) -> bool
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let WriteCommand { message, sent_tx } = command;
    let (message_type, request_id, method) = {
        let (message_type, request_id, method) = message.diagnostic_context();
        (
            message_type,
            request_id.map(ToString::to_string).unwrap_or_default(),
            method.map(ToString::to_string).unwrap_or_default(),
        )
    };

    let text = match message.into_string() {
        Ok(text) => text,
        Err(e) => {
            // A message that won't serialize is a local bug; report it to the
            // sender if one is listening but keep the writer alive
            tracing::error!(err = %e, message_type, "Failed to serialize outbound message to JSON");
            if let Some(tx) = sent_tx {
                let _ = tx.send(Err(e));
            }
            return true;
        }
    };

    match sink.send(text).await {
        Ok(()) => {
            if let Some(tx) = sent_tx {
                let _ = tx.send(Ok(()));
            }
            true
        }
        Err(e) => {
            tracing::warn!(
                err = %e,
                message_type,
                method = %method,
                request_id = %request_id,
                "Failed to write message to peer; likely the connection was closed by the remote peer"
            );
            if let Some(tx) = sent_tx {
                let _ = tx.send(Err(JsonRpcError::Transport { source: e }));
            }
            false
        }
    }
}

/// Flush whatever is already queued, bounded by the drain deadline, then fail
/// the rest.
async fn drain<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    commands: &mut mpsc::Receiver<WriteCommand>,
    drain_timeout: Option<Duration>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    // Close the queue so in-flight senders resolve and recv() can observe
    // emptiness rather than blocking forever
    commands.close();

    let deadline = drain_timeout.map(|timeout| tokio::time::Instant::now() + timeout);

    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, commands.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(
                        ?drain_timeout,
                        "Timed out draining the outbound queue; remaining messages are dropped"
                    );
                    fail_remaining(commands).await;
                    return;
                }
            },
            None => commands.recv().await,
        };

        match next {
            Some(command) => {
                if !write_one(sink, command).await {
                    fail_remaining(commands).await;
                    return;
                }
            }
            None => return,
        }
    }
}

/// Fail every command still in the queue without writing it.
async fn fail_remaining(commands: &mut mpsc::Receiver<WriteCommand>) {
    commands.close();
    while let Some(command) = commands.recv().await {
        if let Some(tx) = command.sent_tx {
            let _ = tx.send(Err(JsonRpcError::PendingRequestConnectionClosed));
        }
    }
}
