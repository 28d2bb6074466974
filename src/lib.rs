//! A JSON-RPC 2.0 engine specialized for the Language Server Protocol.
//!
//! This crate is the message transport and request-lifecycle core: it frames a
//! byte stream into discrete JSON-RPC messages, dispatches them to registered
//! handlers, manages the lifecycle of in-flight requests (peer cancellation
//! via `$/cancelRequest`, content-modified abandonment, timeouts, shutdown),
//! and routes responses back to outstanding outbound requests.  Both sides of
//! an LSP session are peers under JSON-RPC, so the same [`attach`] call serves
//! the client and the server role alike.
//!
//! What it deliberately is *not*: an LSP domain model.  Document types,
//! completion payloads, and diagnostics live up-stack; this crate only ever
//! sees their JSON.
//!
//! This library owes a debt to the [`jsonrpsee`](https://github.com/paritytech/jsonrpsee)
//! project, a more general-purpose JSON-RPC framework in Rust, which is
//! probably what you should use if you just want to talk JSON-RPC and don't
//! need LSP's lifecycle semantics.

mod connection;
mod error;
mod framing;
mod handler;
mod invoker;
mod outbound;
mod receiver;
mod requests;
mod router;
#[cfg(test)]
pub mod testing;
mod types;

pub use connection::{
    CANCEL_REQUEST_METHOD, ConnectionEventLoopFuture, ConnectionHandle, ConnectionOptions,
    RequestHandle, attach,
};
pub use error::{JsonRpcError, Result};
pub use framing::FrameCodec;
pub use handler::{FnHandler, Handler, IntoResponse, Invocation, TypedHandler, from_fn, typed};
pub use router::{HandlerDescriptor, HandlerKind, Registration, Router};
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, InvalidRequest, JsonValue, Message, Method, Notification,
    Request, Response, ResponsePayload, SuccessResponse, TwoPointZero,
};
