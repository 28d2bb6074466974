//! Rust struct definitions that ser/de to/from JSON-RPC messages.
//!
//! These are deliberately naive owned types rather than the borrowed zero-copy
//! representations some JSON-RPC crates use.  Messages at the language-server
//! scale are small, and owned values make the concurrent request machinery in
//! the rest of this crate much simpler to reason about.
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{JsonRpcError, Result};
/// The protocol version marker is exactly the one `jsonrpsee` defines, so just
/// re-export it rather than re-invent a unit struct that ser/des to `"2.0"`.
///
/// Note that `jsonrpsee`'s error code enum is *not* reused: this crate needs
/// the LSP-reserved codes (`RequestCancelled`, `ContentModified`) as
/// first-class variants, so [`ErrorCode`] below mirrors the same shape with
/// those added.
pub use jsonrpsee_types::params::TwoPointZero;
pub use serde_json::Value as JsonValue;

/// Request Id
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Id {
    /// Null
    Null,
    /// Numeric id
    Number(u64),
    /// String id
    Str(String),
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Null => write!(f, "null"),
            Id::Number(num) => write!(f, "{}", num),
            Id::Str(string) => write!(f, "{}", string),
        }
    }
}

/// Name of a JSON-RPC method.
///
/// A newtype rather than a bare `String` so method names get their own
/// `Display` impl and can't be confused with other stringly-typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(String);

impl Method {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Method {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<&str> for Method {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Serializable [JSON-RPC request object](https://www.jsonrpc.org/specification#request-object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Request ID
    pub id: Id,
    /// Name of the method to be invoked.
    pub method: Method,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    /// Create a serializable JSON-RPC method call.
    pub fn new(id: Id, method: impl Into<Method>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// JSON-RPC Invalid request as defined in the [spec](https://www.jsonrpc.org/specification#request-object).
///
/// If the request has an invalid shape, but still has an id, we will try to deserialize it into
/// this struct so that when we send back the error response complaining about the invalid request
/// we can at least include the ID of the request for the client to match it up with the request
/// that caused the error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidRequest {
    /// Request ID
    pub id: Id,
}

/// Serializable [JSON-RPC notification object](https://www.jsonrpc.org/specification#request-object).
///
/// Differs from the request object in that it does not have an `id` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Name of the method to be invoked.
    pub method: Method,
    /// Parameter values of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Notification {
    /// Create a serializable JSON-RPC notification.
    pub fn new(method: impl Into<Method>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// JSON-RPC response object as defined in the [spec](https://www.jsonrpc.org/specification#response_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Payload which can be result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
    /// Request ID
    pub id: Id,
}

impl Response {
    /// Create a new response with some payload already constructed
    pub fn new(id: Id, payload: ResponsePayload) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload,
            id,
        }
    }

    /// Create an owned successful response
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self::new(id, ResponsePayload::success(result))
    }

    /// Create an error response
    pub fn error(
        id: Id,
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self::new(
            id,
            ResponsePayload::Error(ErrorResponse {
                error: ErrorDetails {
                    code,
                    message: message.into(),
                    data: data.into(),
                },
            }),
        )
    }

    /// Create an error response from already-constructed error details
    pub fn error_detail(id: Id, details: ErrorDetails) -> Self {
        Self::new(id, ResponsePayload::Error(details.into()))
    }
}

/// Possible payloads of a JSON RPC response
///
/// This is an `untagged` enum so that serde will try to deserialize into each variant in order
/// until one succeeds.  This works because success responses should have `result` and error
/// responses should have `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Corresponds to failed JSON-RPC response with an error object with the field `error`.
    Error(ErrorResponse),
    /// Corresponds to successful JSON-RPC response with the field `result`.
    Success(SuccessResponse),
}

impl ResponsePayload {
    /// Create a successful response payload
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Serialize our way to a successful response payload, handling serialization error by
    /// producing an error payload instead
    pub fn serialize_to_success<T: Serialize>(result: T) -> Self {
        match serde_json::to_value(result) {
            Ok(json) => Self::Success(json.into()),
            Err(e) => {
                let e = JsonRpcError::SerResponse {
                    source: e,
                    type_name: std::any::type_name::<T>(),
                };
                let details: ErrorDetails = e.into();
                Self::Error(details.into())
            }
        }
    }

    /// Create an error response payload
    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(details.into().into())
    }

    /// Whether this payload is the error kind
    pub fn is_error(&self) -> bool {
        matches!(self, ResponsePayload::Error(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

impl From<JsonValue> for SuccessResponse {
    fn from(result: JsonValue) -> Self {
        Self { result }
    }
}

/// [Failed JSON-RPC response object](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

impl From<ErrorDetails> for ErrorResponse {
    fn from(error: ErrorDetails) -> Self {
        Self { error }
    }
}

/// JSON-RPC error codes used by this crate.
///
/// The numeric values in the `-32700..=-32600` range are reserved by the
/// JSON-RPC 2.0 spec; `-32800` and `-32801` are reserved by the LSP base
/// protocol.  Anything else round-trips through [`ErrorCode::ServerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist / is not available.
    MethodNotFound,
    /// Invalid method parameter(s).
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// The request was cancelled, either by the peer or by a request timeout.
    RequestCancelled,
    /// The document the request was computed against changed while the request
    /// was in flight, so the result would be stale.
    ContentModified,
    /// Any other code, including the `-32099..=-32000` server-defined range,
    /// is passed through verbatim.
    ServerError(i32),
}

impl ErrorCode {
    /// The numeric code that goes on the wire.
    pub const fn code(&self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::RequestCancelled => -32800,
            ErrorCode::ContentModified => -32801,
            ErrorCode::ServerError(code) => *code,
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32800 => ErrorCode::RequestCancelled,
            -32801 => ErrorCode::ContentModified,
            other => ErrorCode::ServerError(other),
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        Ok(code.into())
    }
}

/// [JSON-RPC failed response error details](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Code
    pub code: ErrorCode,
    /// Message
    pub message: String,
    /// Optional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn request_cancelled(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::RequestCancelled, message, data)
    }
    pub fn content_modified(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ContentModified, message, data)
    }
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }
}

/// Every possible (valid) JSON-RPC message that can be sent over the wire
///
/// Represented as an `untagged` enum so serde will try to deserialize into each variant in order
/// until one succeeds.  This is the most flexible way to represent the JSON-RPC protocol, as it
/// allows for proper handling of each message type.
///
/// The order of variants is important for deserialization since serde will try each variant in
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// A batch of messages
    Batch(Vec<Message>),

    /// A request with method, id, and optional params
    Request(Request),

    /// A notification with method and optional params but no id
    Notification(Notification),

    /// A response containing either a result or error
    Response(Response),

    /// An invalid request that still has an id
    InvalidRequest(InvalidRequest),
}

impl Message {
    /// Attempt to deserialize a message from a string
    ///
    /// Transport implementations should prefer to use this implementation rather than their own
    /// interpretation.
    pub fn from_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| JsonRpcError::ParseJson {
            source: e,
            json: text.to_string(),
        })
    }

    /// Attempt to deserialize a message from an already-parsed JSON value.
    ///
    /// The input handler parses inbound text in two stages, first to a
    /// [`JsonValue`] (failure there is a `ParseError`) and then to a `Message`
    /// (failure there is an `InvalidRequest`), so it can reply with the error
    /// code the JSON-RPC spec calls for in each case.
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Attempt to serialize this message into a UTF-8 String
    ///
    /// This is fallible but unlikely to fail barring memory issues.
    ///
    /// Transport implementations should prefer to use this implementation rather than their own.
    pub fn into_string(self) -> Result<String> {
        serde_json::to_string(&self).map_err(|e| JsonRpcError::SerResponse {
            source: e,
            type_name: std::any::type_name::<Self>(),
        })
    }

    /// Contextual metadata about this message for logging, as
    /// `(message_type, request_id, method)`.
    pub(crate) fn diagnostic_context(&self) -> (&'static str, Option<&Id>, Option<&Method>) {
        match self {
            Message::Batch(_) => ("batch", None, None),
            Message::Request(request) => ("request", Some(&request.id), Some(&request.method)),
            Message::Notification(notification) => ("notification", None, Some(&notification.method)),
            Message::Response(response) => ("response", Some(&response.id), None),
            Message::InvalidRequest(invalid_request) => ("invalid_request", Some(&invalid_request.id), None),
        }
    }
}
