//! Handlers are the code that runs in response to inbound method calls and
//! notifications.
//!
//! All such code implements [`Handler`], a dyn-compatible async trait.  Most
//! users will not implement it directly; [`from_fn`] wraps an async function
//! that works with raw JSON, and [`typed`] additionally generates the serde
//! marshalling at registration time so the function can take and return plain
//! Rust types.
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::types;
use crate::{JsonRpcError, Result};

/// Everything a handler gets to see about the invocation it is servicing.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The request id, or `None` when invoked as a notification.
    pub id: Option<types::Id>,
    /// The method name the peer used.
    pub method: types::Method,
    /// Raw request parameters, if any.
    pub params: Option<JsonValue>,
    /// Cancellation is cooperative: long-running handlers should check this
    /// token at every suspension point.  It fires when the peer cancels the
    /// request, when the request times out, when a watched document changes,
    /// or when the connection shuts down.
    pub cancellation_token: CancellationToken,
}

impl Invocation {
    pub(crate) fn from_request(request: types::Request, cancellation_token: CancellationToken) -> Self {
        Self {
            id: Some(request.id),
            method: request.method,
            params: request.params,
            cancellation_token,
        }
    }

    pub(crate) fn from_notification(
        notification: types::Notification,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            id: None,
            method: notification.method,
            params: notification.params,
            cancellation_token,
        }
    }
}

/// A handler for JSON-RPC methods and notifications.
///
/// The same trait serves both kinds; for notifications the returned payload is
/// logged when it is an error and otherwise discarded, since there is no reply
/// to attach it to.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, invocation: Invocation) -> types::ResponsePayload;
}

/// Type implemented by anything that can be converted into a JSON RPC response.
pub trait IntoResponse {
    /// Convert the implementor's type into a JSON RPC response.
    fn into_response(self) -> types::ResponsePayload;
}

/// Handlers that return a result can be automatically converted into a response payload,
/// provided the success type implements [`Serialize`] and the error type implements
/// [`Into<types::ErrorDetails>`].
impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<types::ErrorDetails>,
{
    fn into_response(self) -> types::ResponsePayload {
        match self {
            Ok(value) => types::ResponsePayload::serialize_to_success(value),
            Err(e) => types::ResponsePayload::error(e.into()),
        }
    }
}

/// If a handler returns a `JsonValue`, we assume that it's infallible and this is a success
/// response
impl IntoResponse for JsonValue {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::Success(types::SuccessResponse { result: self })
    }
}

/// Void methods reply with a JSON `null` result.
impl IntoResponse for () {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::success(JsonValue::Null)
    }
}

/// Our internal error type can of course be used as a response type
impl IntoResponse for JsonRpcError {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(Into::<types::ErrorDetails>::into(self))
    }
}

impl IntoResponse for types::ErrorDetails {
    fn into_response(self) -> types::ResponsePayload {
        types::ResponsePayload::error(self)
    }
}

impl IntoResponse for types::ResponsePayload {
    fn into_response(self) -> types::ResponsePayload {
        self
    }
}

/// Wrap an async function operating on the raw [`Invocation`] as a [`Handler`].
pub fn from_fn<F, Fut, Res>(f: F) -> FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoResponse,
{
    FnHandler(f)
}

/// See [`from_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut, Res> Handler for FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoResponse,
{
    async fn handle(&self, invocation: Invocation) -> types::ResponsePayload {
        (self.0)(invocation).await.into_response()
    }
}

/// Wrap an async function taking typed params as a [`Handler`].
///
/// The serde marshalling is baked in here, at registration time: inbound
/// params that do not deserialize into `P` produce an `InvalidParams` reply
/// without the function ever being called.  Absent params deserialize from
/// JSON `null`, so methods whose param type is `Option<_>` or `()` can be
/// invoked without a `params` field at all.
pub fn typed<P, F, Fut, Res>(f: F) -> TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoResponse,
{
    TypedHandler(f, PhantomData)
}

/// See [`typed`].
pub struct TypedHandler<P, F>(F, PhantomData<fn() -> P>);

#[async_trait]
impl<P, F, Fut, Res> Handler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoResponse,
{
    async fn handle(&self, invocation: Invocation) -> types::ResponsePayload {
        let params = invocation.params.unwrap_or(JsonValue::Null);
        let params: P = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!(
                    method = %invocation.method,
                    err = %e,
                    "Request params did not deserialize into the handler's param type"
                );
                return types::ResponsePayload::error(types::ErrorDetails::invalid_params(
                    format!("Invalid params for method '{}'", invocation.method),
                    None,
                ));
            }
        };

        (self.0)(params, invocation.cancellation_token).await.into_response()
    }
}
