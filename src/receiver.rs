//! Classification of decoded JSON-RPC messages.
//!
//! After the framing layer produces a JSON payload and serde turns it into a
//! [`types::Message`], the input handler needs to know what each element *is*
//! before it can dispatch it: requests and notifications go to the invoker,
//! responses go to the pending-outbound table, and invalid envelopes get an
//! error reply.  Batches are flattened so each element is classified
//! independently.
use itertools::Itertools;

use crate::types;

/// One classified element of an inbound message.
#[derive(Debug, Clone)]
pub(crate) enum InboundItem {
    /// A method call that expects exactly one reply
    Request(types::Request),
    /// A fire-and-forget notification
    Notification(types::Notification),
    /// A response to one of our own outbound requests
    Response(types::Response),
    /// An invalid envelope whose id was at least recoverable
    Invalid(types::InvalidRequest),
}

/// The result of classifying one wire message.
///
/// `has_response` is true iff any element is a response directed at an
/// outbound request id; the input handler uses it to route the batch through
/// the response-settlement path before scheduling any handler work.
#[derive(Debug)]
pub(crate) struct ClassifiedBatch {
    pub items: Vec<InboundItem>,
    pub has_response: bool,
}

/// Classify a decoded message into dispatchable items.
///
/// Nested batches are flattened; the JSON-RPC spec is silent on whether they
/// are even legal, but accepting them costs nothing.  An empty batch is a spec
/// violation that gets an `InvalidRequest` reply with a null id.
pub(crate) fn classify(message: types::Message) -> Result<ClassifiedBatch, types::ErrorDetails> {
    fn flatten_batch(messages: Vec<types::Message>) -> Vec<types::Message> {
        messages
            .into_iter()
            .flat_map(|message| match message {
                types::Message::Batch(messages) => flatten_batch(messages),
                _ => vec![message],
            })
            .collect()
    }

    let messages = match message {
        types::Message::Batch(messages) => {
            let messages = flatten_batch(messages);
            if messages.is_empty() {
                // From the JSON-RPC spec, section 6 "batch": an array with no
                // values gets a single error Response object
                tracing::error!("Received empty batch message; this is not valid under the JSON RPC spec");
                return Err(types::ErrorDetails::invalid_request(
                    "Empty batch message is not valid",
                    None,
                ));
            }
            messages
        }
        other => vec![other],
    };

    let items = messages
        .into_iter()
        .map(|message| {
            debug_assert!(!matches!(message, types::Message::Batch(_)));
            match message {
                types::Message::Request(request) => InboundItem::Request(request),
                types::Message::Notification(notification) => InboundItem::Notification(notification),
                types::Message::Response(response) => InboundItem::Response(response),
                types::Message::InvalidRequest(invalid_request) => InboundItem::Invalid(invalid_request),
                types::Message::Batch(_) => unreachable!("nested batches were flattened above"),
            }
        })
        .collect_vec();

    let has_response = items.iter().any(|item| matches!(item, InboundItem::Response(_)));

    Ok(ClassifiedBatch { items, has_response })
}

/// Best-effort recovery of a request id from a JSON value that failed to
/// deserialize as any valid message shape, so the error reply can carry it.
pub(crate) fn recover_id(value: &types::JsonValue) -> types::Id {
    value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value(id).ok())
        .unwrap_or(types::Id::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Id, Message, Notification, Request, Response};
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn single_request_classifies_without_response_flag() {
        let message = Message::Request(Request::new(Id::Number(1), "textDocument/hover", None));
        let batch = classify(message).unwrap();

        assert_eq!(batch.items.len(), 1);
        assert!(!batch.has_response);
        assert_matches!(&batch.items[0], InboundItem::Request(r) if r.id == Id::Number(1));
    }

    #[test]
    fn batch_flattens_and_sets_response_flag() {
        let message = Message::Batch(vec![
            Message::Notification(Notification::new("initialized", None)),
            Message::Batch(vec![Message::Response(Response::success(
                Id::Number(9),
                json!("ok"),
            ))]),
            Message::Request(Request::new(Id::Number(2), "shutdown", None)),
        ]);

        let batch = classify(message).unwrap();
        assert_eq!(batch.items.len(), 3);
        assert!(batch.has_response);
        assert_matches!(&batch.items[0], InboundItem::Notification(_));
        assert_matches!(&batch.items[1], InboundItem::Response(_));
        assert_matches!(&batch.items[2], InboundItem::Request(_));
    }

    #[test]
    fn empty_batch_is_an_error() {
        let err = classify(Message::Batch(vec![])).unwrap_err();
        assert_eq!(err.code, types::ErrorCode::InvalidRequest);
    }

    #[test]
    fn recovers_ids_where_possible() {
        assert_eq!(recover_id(&json!({"id": 42, "garbage": true})), Id::Number(42));
        assert_eq!(
            recover_id(&json!({"id": "abc", "garbage": true})),
            Id::Str("abc".into())
        );
        assert_eq!(recover_id(&json!({"garbage": true})), Id::Null);
        assert_eq!(recover_id(&json!({"id": {"not": "an id"}})), Id::Null);
    }
}
