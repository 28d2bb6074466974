//! End-to-end tests of the request lifecycle, driven at the wire level: a real
//! connection on one end of an in-memory pipe, and a hand-rolled framed client
//! on the other so the tests can assert exactly what goes over the wire.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use lsp_jsonrpc::{
    ConnectionHandle, ConnectionOptions, FrameCodec, HandlerDescriptor, Invocation, JsonRpcError,
    JsonValue, Router, from_fn, typed,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::Decoder;

/// How long tests wait for a reply before declaring the engine wedged.
const REPLY_DEADLINE: Duration = Duration::from_secs(5);

/// The raw peer: writes frames byte-by-byte and decodes replies with the same
/// codec the engine uses.
struct RawPeer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    codec: FrameCodec,
    buf: BytesMut,
}

impl RawPeer {
    async fn write_json(&mut self, value: JsonValue) {
        self.write_payload(&value.to_string()).await;
    }

    async fn write_payload(&mut self, payload: &str) {
        let frame = format!("Content-Length: {}\r\n\r\n{payload}", payload.len());
        self.writer.write_all(frame.as_bytes()).await.unwrap();
    }

    async fn next_message(&mut self) -> JsonValue {
        self.try_next_message(REPLY_DEADLINE)
            .await
            .expect("timed out waiting for a frame from the connection")
    }

    /// Read the next frame, or None if the deadline passes with nothing sent.
    async fn try_next_message(&mut self, deadline: Duration) -> Option<JsonValue> {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                return Some(serde_json::from_str(&frame).unwrap());
            }

            let mut chunk = [0u8; 4096];
            match tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => panic!("read error from connection under test: {e}"),
                Err(_) => return None,
            }
        }
    }

    fn request(id: u64, method: &str, params: JsonValue) -> JsonValue {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    fn notification(method: &str, params: JsonValue) -> JsonValue {
        json!({"jsonrpc": "2.0", "method": method, "params": params})
    }
}

/// Attach a connection with the given options and router to one end of a
/// pipe, returning the raw peer on the other end and the connection's handle.
fn serve(options: ConnectionOptions, router: Router) -> (RawPeer, ConnectionHandle) {
    let (peer_side, engine_side) = tokio::io::duplex(64 * 1024);
    let (peer_reader, peer_writer) = tokio::io::split(peer_side);
    let (engine_reader, engine_writer) = tokio::io::split(engine_side);

    let (event_loop, handle) = lsp_jsonrpc::attach(options, router, engine_reader, engine_writer);
    tokio::spawn(event_loop);

    (
        RawPeer {
            reader: peer_reader,
            writer: peer_writer,
            codec: FrameCodec::new(),
            buf: BytesMut::new(),
        },
        handle,
    )
}

/// A handler that sleeps far longer than any test runs, standing in for work
/// that never finishes on its own.
fn sleepy_handler() -> impl lsp_jsonrpc::Handler {
    from_fn(|_invocation: Invocation| async move {
        tokio::time::sleep(Duration::from_secs(50)).await;
        json!("finally done")
    })
}

fn completion_params(uri: &str) -> JsonValue {
    json!({"textDocument": {"uri": uri}, "position": {"line": 3, "character": 14}})
}

#[tokio::test]
async fn peer_cancellation_produces_request_cancelled_reply() {
    let router = Router::new();
    router
        .register(HandlerDescriptor::request("textDocument/completion", sleepy_handler()))
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::request(
        1,
        "textDocument/completion",
        completion_params("file:///a/file.cs"),
    ))
    .await;
    peer.write_json(RawPeer::notification("$/cancelRequest", json!({"id": 1})))
        .await;

    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["error"]["code"], -32800);
    assert!(reply.get("result").is_none());
}

#[tokio::test]
async fn content_modified_abandons_requests_for_the_document() {
    let did_change_ran = Arc::new(AtomicUsize::new(0));

    let router = Router::new();
    router
        .register(HandlerDescriptor::request(
            "textDocument/completion",
            from_fn(|invocation: Invocation| async move {
                // Awaits cancellation, then keeps going like nothing happened
                invocation.cancellation_token.cancelled().await;
                json!("stale result")
            }),
        ))
        .unwrap()
        .forever();
    router
        .register(HandlerDescriptor::notification("textDocument/didChange", {
            let did_change_ran = did_change_ran.clone();
            from_fn(move |_invocation: Invocation| {
                let did_change_ran = did_change_ran.clone();
                async move {
                    did_change_ran.fetch_add(1, Ordering::SeqCst);
                    JsonValue::Null
                }
            })
        }))
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::request(
        1,
        "textDocument/completion",
        completion_params("file:///a/file.cs"),
    ))
    .await;
    peer.write_json(RawPeer::notification(
        "textDocument/didChange",
        json!({"textDocument": {"uri": "file:///a/file.cs"}, "contentChanges": []}),
    ))
    .await;

    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["error"]["code"], -32801);

    // The didChange handler itself must have run to completion
    let deadline = tokio::time::Instant::now() + REPLY_DEADLINE;
    while did_change_ran.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "didChange handler never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(did_change_ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn content_modified_leaves_other_documents_alone() {
    let router = Router::new();
    router
        .register(HandlerDescriptor::request("textDocument/completion", sleepy_handler()))
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::request(
        1,
        "textDocument/completion",
        completion_params("file:///a.rs"),
    ))
    .await;
    peer.write_json(RawPeer::notification(
        "textDocument/didChange",
        json!({"textDocument": {"uri": "file:///b.rs"}, "contentChanges": []}),
    ))
    .await;

    // Nothing should come back: the in-flight request targets a different uri
    assert_eq!(peer.try_next_message(Duration::from_millis(500)).await, None);
}

#[tokio::test]
async fn timeout_cancels_with_request_cancelled_code() {
    // The timeout policy holds whether or not content-modified support is on
    for supports_content_modified in [true, false] {
        let router = Router::new();
        router
            .register(HandlerDescriptor::request("textDocument/references", sleepy_handler()))
            .unwrap()
            .forever();

        let (mut peer, _handle) = serve(
            ConnectionOptions {
                maximum_request_timeout: Some(Duration::from_millis(300)),
                supports_content_modified,
                ..ConnectionOptions::default()
            },
            router,
        );

        peer.write_json(RawPeer::request(
            9,
            "textDocument/references",
            completion_params("file:///a.rs"),
        ))
        .await;

        let started = tokio::time::Instant::now();
        let reply = peer.next_message().await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], -32800);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "timeout reply must not wait for the handler"
        );
    }
}

#[tokio::test]
async fn unknown_method_gets_method_not_found_and_stream_continues() {
    let router = Router::new();
    router
        .register_request("echo", |params: JsonValue, _cancel| async move {
            Result::<_, JsonRpcError>::Ok(params)
        })
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::request(5, "foo/bar", json!({}))).await;
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["error"]["code"], -32601);

    peer.write_json(RawPeer::request(6, "echo", json!({"alive": true}))).await;
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 6);
    assert_eq!(reply["result"], json!({"alive": true}));
}

#[tokio::test]
async fn parse_error_replies_null_id_and_recovers() {
    let router = Router::new();
    router
        .register_request("echo", |params: JsonValue, _cancel| async move {
            Result::<_, JsonRpcError>::Ok(params)
        })
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_payload("not{}").await;
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], JsonValue::Null);
    assert_eq!(reply["error"]["code"], -32700);

    // The next well-formed frame is processed normally
    peer.write_json(RawPeer::request(1, "echo", json!("still here"))).await;
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"], json!("still here"));
}

#[tokio::test]
async fn invalid_envelope_gets_invalid_request_with_recovered_id() {
    let (mut peer, _handle) = serve(ConnectionOptions::default(), Router::new());

    // Valid JSON, nothing like a valid JSON-RPC message, but the id survives
    peer.write_json(json!({"jsonrpc": "2.0", "id": 17, "methood": "oops"})).await;
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 17);
    assert_eq!(reply["error"]["code"], -32600);
}

#[tokio::test]
async fn delayed_notification_is_delivered_exactly_once_with_no_reply() {
    let diagnostics_seen = Arc::new(AtomicUsize::new(0));

    let router = Router::new();
    router
        .register(HandlerDescriptor::notification("textDocument/publishDiagnostics", {
            let diagnostics_seen = diagnostics_seen.clone();
            from_fn(move |_invocation: Invocation| {
                let diagnostics_seen = diagnostics_seen.clone();
                async move {
                    // A deliberately slow consumer
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    diagnostics_seen.fetch_add(1, Ordering::SeqCst);
                    JsonValue::Null
                }
            })
        }))
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::notification(
        "textDocument/publishDiagnostics",
        json!({"uri": "file:///a.rs", "diagnostics": [{"message": "oh no"}]}),
    ))
    .await;

    // Notifications never produce a reply, no matter how long the handler takes
    assert_eq!(peer.try_next_message(Duration::from_millis(900)).await, None);
    assert_eq!(diagnostics_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn serial_group_runs_in_wire_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let record = |name: &'static str, delay: Duration, order: Arc<std::sync::Mutex<Vec<&'static str>>>| {
        typed(move |_params: JsonValue, _cancel| {
            let order = order.clone();
            async move {
                tokio::time::sleep(delay).await;
                order.lock().unwrap().push(name);
                Result::<_, JsonRpcError>::Ok(name)
            }
        })
    };

    let router = Router::new();
    router
        .register(
            HandlerDescriptor::request(
                "doc/read",
                record("read", Duration::from_millis(300), order.clone()),
            )
            .with_serial_group("doc"),
        )
        .unwrap()
        .forever();
    router
        .register(
            HandlerDescriptor::notification(
                "doc/write",
                record("write", Duration::from_millis(0), order.clone()),
            )
            .with_serial_group("doc"),
        )
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    // The slow read goes first on the wire; the instant write must still wait
    peer.write_json(RawPeer::request(1, "doc/read", json!({}))).await;
    peer.write_json(RawPeer::notification("doc/write", json!({}))).await;

    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"], json!("read"));

    let deadline = tokio::time::Instant::now() + REPLY_DEADLINE;
    while order.lock().unwrap().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "write handler never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*order.lock().unwrap(), vec!["read", "write"]);
}

#[tokio::test]
async fn notifications_of_one_method_run_in_wire_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let router = Router::new();
    router
        .register(HandlerDescriptor::notification("counter/tick", {
            let order = order.clone();
            from_fn(move |invocation: Invocation| {
                let order = order.clone();
                async move {
                    let n = invocation.params.as_ref().and_then(JsonValue::as_u64).unwrap();
                    // The earlier ticks dawdle; order must still hold
                    tokio::time::sleep(Duration::from_millis(50 * (4 - n))).await;
                    order.lock().unwrap().push(n);
                    JsonValue::Null
                }
            })
        }))
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    for n in 1..=3u64 {
        peer.write_json(RawPeer::notification("counter/tick", json!(n))).await;
    }

    let deadline = tokio::time::Instant::now() + REPLY_DEADLINE;
    while order.lock().unwrap().len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "tick handlers never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn exactly_one_reply_per_request_id_even_when_cancel_races_completion() {
    let router = Router::new();
    router
        .register_request("quick", |_params: JsonValue, _cancel| async move {
            Result::<_, JsonRpcError>::Ok("done")
        })
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::request(1, "quick", json!({}))).await;
    peer.write_json(RawPeer::notification("$/cancelRequest", json!({"id": 1})))
        .await;

    let mut replies_for_id_1 = 0;
    while let Some(reply) = peer.try_next_message(Duration::from_millis(500)).await {
        assert_eq!(reply["id"], 1);
        replies_for_id_1 += 1;
    }
    assert_eq!(replies_for_id_1, 1, "exactly one reply per inbound request id");
}

#[tokio::test]
async fn cancel_for_unknown_id_is_dropped() {
    let router = Router::new();
    router
        .register_request("echo", |params: JsonValue, _cancel| async move {
            Result::<_, JsonRpcError>::Ok(params)
        })
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    // Cancelling before the request is registered has no retroactive effect
    peer.write_json(RawPeer::notification("$/cancelRequest", json!({"id": 42})))
        .await;
    peer.write_json(RawPeer::request(42, "echo", json!("ran anyway"))).await;

    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["result"], json!("ran anyway"));
}

#[tokio::test]
async fn duplicate_request_id_is_rejected_without_touching_the_original() {
    let router = Router::new();
    router
        .register(HandlerDescriptor::request("textDocument/completion", sleepy_handler()))
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(RawPeer::request(
        1,
        "textDocument/completion",
        completion_params("file:///a.rs"),
    ))
    .await;
    peer.write_json(RawPeer::request(
        1,
        "textDocument/completion",
        completion_params("file:///a.rs"),
    ))
    .await;

    // The duplicate is refused with no id anchor; the original stays in flight
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], JsonValue::Null);
    assert_eq!(reply["error"]["code"], -32600);

    // Cancel the original; its reply still arrives under its id, exactly once
    peer.write_json(RawPeer::notification("$/cancelRequest", json!({"id": 1})))
        .await;
    let reply = peer.next_message().await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["error"]["code"], -32800);
}

#[tokio::test]
async fn batch_elements_are_dispatched_independently() {
    let router = Router::new();
    router
        .register_request("echo", |params: JsonValue, _cancel| async move {
            Result::<_, JsonRpcError>::Ok(params)
        })
        .unwrap()
        .forever();

    let (mut peer, _handle) = serve(ConnectionOptions::default(), router);

    peer.write_json(json!([
        {"jsonrpc": "2.0", "id": 1, "method": "echo", "params": "one"},
        {"jsonrpc": "2.0", "method": "some/notification"},
        {"jsonrpc": "2.0", "id": 2, "method": "echo", "params": "two"},
    ]))
    .await;

    let mut results = std::collections::HashMap::new();
    for _ in 0..2 {
        let reply = peer.next_message().await;
        results.insert(reply["id"].as_u64().unwrap(), reply["result"].clone());
    }
    assert_eq!(results[&1], json!("one"));
    assert_eq!(results[&2], json!("two"));
}

#[tokio::test]
async fn outbound_requests_from_the_handle_reach_the_peer() {
    let (mut peer, handle) = serve(ConnectionOptions::default(), Router::new());

    let call_task = tokio::spawn(async move {
        handle
            .call_with_params::<_, JsonValue>("workspace/configuration", json!({"items": []}))
            .await
    });

    // The request shows up on the wire with the monotone integer id
    let request = peer.next_message().await;
    assert_eq!(request["id"], 1);
    assert_eq!(request["method"], "workspace/configuration");

    // Answer it; the caller's promise resolves with the result
    peer.write_json(json!({"jsonrpc": "2.0", "id": 1, "result": ["some setting"]}))
        .await;
    let result = call_task.await.unwrap().unwrap();
    assert_eq!(result, json!(["some setting"]));

    // A response for an id we never issued is silently discarded
    peer.write_json(json!({"jsonrpc": "2.0", "id": 999, "result": "nobody asked"}))
        .await;
    assert_eq!(peer.try_next_message(Duration::from_millis(300)).await, None);
}
