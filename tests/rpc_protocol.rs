#![allow(missing_docs)]

//! Request/response protocol over an in-memory transport.

mod common;

use common::ChannelTransport;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use teamwire::protocol::{Protocol, RpcProtocol};
use teamwire::transport::{MessageKind, Transport, TransportConfig, TransportMessage};
use teamwire::FabricError;

fn rpc_over_channel(timeout: Duration) -> (RpcProtocol, Arc<ChannelTransport>) {
    let transport = Arc::new(ChannelTransport::new(
        TransportConfig::new("mem://test").with_timeout(timeout),
    ));
    let protocol = RpcProtocol::new(transport.clone());
    (protocol, transport)
}

#[tokio::test]
async fn request_resolves_when_response_arrives() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(5));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    let proto = protocol.clone();
    let request_task =
        tokio::spawn(async move { proto.request("status", json!({}), None).await });

    // Wait until the request frame is on the wire, then answer it.
    let id = loop {
        if let Some(frame) = transport.sent().first().cloned() {
            assert_eq!(frame.kind, MessageKind::Request);
            break frame.id.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    transport
        .inject(TransportMessage::response(id, json!({ "result": { "healthy": true } })))
        .await;

    let result = request_task.await.unwrap().unwrap();
    assert_eq!(result["healthy"], true);
    assert_eq!(protocol.pending_requests(), 0);
}

#[tokio::test]
async fn silent_peer_times_out_and_releases_the_correlation_entry() {
    let (protocol, transport) = rpc_over_channel(Duration::from_millis(100));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    let err = protocol.request("status", json!({}), None).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(protocol.pending_requests(), 0);

    // A late response for the timed-out id is ignored.
    let id = transport.sent()[0].id.clone().unwrap();
    transport.inject(TransportMessage::response(id, json!({ "result": 1 }))).await;
    assert_eq!(protocol.pending_requests(), 0);
}

#[tokio::test]
async fn remote_error_payload_raises_protocol_error() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(5));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    let proto = protocol.clone();
    let request_task =
        tokio::spawn(async move { proto.request("explode", json!({}), None).await });

    let id = loop {
        if let Some(frame) = transport.sent().first().cloned() {
            break frame.id.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    transport
        .inject(TransportMessage::response(
            id,
            json!({ "error": { "code": -32000, "message": "boom" } }),
        ))
        .await;

    let err = request_task.await.unwrap().unwrap_err();
    assert!(matches!(err, FabricError::Protocol(msg) if msg.contains("boom")));
}

#[tokio::test]
async fn inbound_request_dispatches_to_handler() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(5));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    protocol.add_handler(
        "sum",
        Arc::new(|params: Value| {
            Box::pin(async move {
                let a = params["a"].as_i64().unwrap_or(0);
                let b = params["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
        }),
    );

    transport
        .inject(TransportMessage::request(
            "req-1",
            json!({ "method": "sum", "params": { "a": 2, "b": 3 } }),
        ))
        .await;

    let sent = transport.sent();
    let response = sent.last().unwrap();
    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.id.as_deref(), Some("req-1"));
    assert_eq!(response.payload["result"], 5);
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(5));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    transport
        .inject(TransportMessage::request("req-9", json!({ "method": "nope", "params": {} })))
        .await;

    let sent = transport.sent();
    let response = sent.last().unwrap();
    assert_eq!(response.payload["error"]["code"], -32601);
    assert_eq!(response.payload["error"]["message"], "Method not found");
}

#[tokio::test]
async fn handler_failure_yields_internal_error() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(5));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    protocol.add_handler(
        "explode",
        Arc::new(|_| Box::pin(async { Err(FabricError::Worker("handler broke".into())) })),
    );

    transport
        .inject(TransportMessage::request("req-2", json!({ "method": "explode", "params": {} })))
        .await;

    let sent = transport.sent();
    let response = sent.last().unwrap();
    assert_eq!(response.payload["error"]["code"], -32603);
    assert!(response.payload["error"]["message"]
        .as_str()
        .unwrap()
        .contains("handler broke"));
}

#[tokio::test]
async fn stop_drains_pending_requests() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(60));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    let proto = protocol.clone();
    let request_task =
        tokio::spawn(async move { proto.request("status", json!({}), None).await });

    // Let the request register its pending entry, then stop the protocol.
    loop {
        if protocol.pending_requests() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    protocol.stop().await.unwrap();

    let err = request_task.await.unwrap().unwrap_err();
    assert!(err.is_connection());
    assert_eq!(protocol.pending_requests(), 0);
}

#[tokio::test]
async fn notify_sends_without_id() {
    let (protocol, transport) = rpc_over_channel(Duration::from_secs(5));
    transport.connect().await.unwrap();
    protocol.start().await.unwrap();

    protocol.notify("heartbeat", json!({ "seq": 1 })).await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageKind::Notification);
    assert_eq!(sent[0].id, None);
    assert_eq!(sent[0].payload["method"], "heartbeat");
}
