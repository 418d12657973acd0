// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end bridge tests over the in-process relay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use tether_bridge::{
    BridgeClient, BridgeClientConfig, ClientEvent, ClientExit, InvocationHandler,
    MemoryConnector, Relay, RelayOutcome, Stub, StubConfig,
};
use tether_protocol::{
    InvocationContext, InvocationPayload, InvocationResult, MemoryBlobStore, RemoteError,
};

/// Answers every invocation with a fixed result after an optional delay.
struct FixedHandler {
    result: InvocationResult,
    delay: Duration,
}

#[async_trait]
impl InvocationHandler for FixedHandler {
    async fn handle(&self, _payload: InvocationPayload) -> InvocationResult {
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

/// Echoes the event and forwarded environment back.
struct EchoHandler;

#[async_trait]
impl InvocationHandler for EchoHandler {
    async fn handle(&self, payload: InvocationPayload) -> InvocationResult {
        InvocationResult::Success {
            body: json!({
                "functionId": payload.function_id,
                "event": payload.event,
                "env": payload.env,
            }),
        }
    }
}

fn context(request_id: &str) -> InvocationContext {
    InvocationContext {
        aws_request_id: request_id.to_string(),
        function_name: "api".to_string(),
        ..Default::default()
    }
}

fn ok_handler() -> Arc<dyn InvocationHandler> {
    Arc::new(FixedHandler {
        result: InvocationResult::Success {
            body: json!({"status": "ok"}),
        },
        delay: Duration::ZERO,
    })
}

async fn wait_registered(events: &mut broadcast::Receiver<ClientEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::Registered { client_id }) = events.recv().await {
                return client_id;
            }
        }
    })
    .await
    .expect("client did not register")
}

fn start_client(
    connector: Arc<MemoryConnector>,
    handler: Arc<dyn InvocationHandler>,
) -> (Arc<BridgeClient>, tokio::task::JoinHandle<ClientExit>) {
    let client = Arc::new(BridgeClient::new(
        connector,
        handler,
        BridgeClientConfig::default(),
    ));
    let running = client.clone();
    let handle = tokio::spawn(async move { running.run().await });
    (client, handle)
}

#[tokio::test]
async fn test_stub_invocation_round_trip() {
    let relay = Arc::new(Relay::new());
    let connector = Arc::new(MemoryConnector::new(relay.clone()));
    let (client, handle) = start_client(connector.clone(), ok_handler());
    let mut events = client.subscribe();
    wait_registered(&mut events).await;

    let stub = Stub::with_env(connector, StubConfig::new("fn-api"), BTreeMap::new());
    let event = json!({"body": "x".repeat(2048)});
    let response = stub
        .invoke(event, context("abc-123"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response, json!({"status": "ok"}));
    assert_eq!(stub.pending(), 0);

    client.shutdown_handle().notify_one();
    assert_eq!(handle.await.unwrap(), ClientExit::Shutdown);
}

#[tokio::test]
async fn test_handler_error_is_rethrown() {
    let relay = Arc::new(Relay::new());
    let connector = Arc::new(MemoryConnector::new(relay));
    let error = RemoteError {
        error_type: "TypeError".to_string(),
        error_message: "cannot read property 'id' of undefined".to_string(),
        stack_trace: vec!["at handler (index.js:3:10)".to_string()],
    };
    let handler = Arc::new(FixedHandler {
        result: InvocationResult::Failure {
            error: error.clone(),
        },
        delay: Duration::ZERO,
    });
    let (client, _handle) = start_client(connector.clone(), handler);
    wait_registered(&mut client.subscribe()).await;

    let stub = Stub::with_env(connector, StubConfig::new("fn-api"), BTreeMap::new());
    let thrown = stub
        .invoke(json!({}), context("req-err"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(thrown, error);
}

#[tokio::test]
async fn test_environment_is_forwarded() {
    let relay = Arc::new(Relay::new());
    let connector = Arc::new(MemoryConnector::new(relay));
    let (client, _handle) = start_client(connector.clone(), Arc::new(EchoHandler));
    wait_registered(&mut client.subscribe()).await;

    let env = BTreeMap::from([("TABLE_NAME".to_string(), "orders".to_string())]);
    let stub = Stub::with_env(connector, StubConfig::new("fn-orders"), env);
    let response = stub
        .invoke(json!({"id": 7}), context("req-env"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response["functionId"], "fn-orders");
    assert_eq!(response["event"]["id"], 7);
    assert_eq!(response["env"]["TABLE_NAME"], "orders");
}

#[tokio::test]
async fn test_no_client_resolves_without_hanging() {
    let relay = Arc::new(Relay::new());
    let stub = Stub::with_env(
        Arc::new(MemoryConnector::new(relay)),
        StubConfig::new("fn-api"),
        BTreeMap::new(),
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        stub.forward(json!({}), context("req-none"), Duration::from_secs(2)),
    )
    .await
    .expect("stub hung")
    .unwrap();
    assert_eq!(outcome, RelayOutcome::NoClientConnected);
}

#[tokio::test]
async fn test_slow_handler_times_out_before_deadline() {
    let relay = Arc::new(Relay::new());
    let connector = Arc::new(MemoryConnector::new(relay));
    let handler = Arc::new(FixedHandler {
        result: InvocationResult::Success { body: json!(null) },
        delay: Duration::from_secs(10),
    });
    let (client, _handle) = start_client(connector.clone(), handler);
    wait_registered(&mut client.subscribe()).await;

    let mut config = StubConfig::new("fn-slow");
    config.timeout_margin = Duration::from_millis(100);
    let stub = Stub::with_env(connector, config, BTreeMap::new());

    let outcome = stub
        .forward(json!({}), context("req-slow"), Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(outcome, RelayOutcome::Timeout);
    assert_eq!(stub.pending(), 0);
}

#[tokio::test]
async fn test_second_client_supersedes_first() {
    let relay = Arc::new(Relay::new());
    let connector = Arc::new(MemoryConnector::new(relay.clone()));

    let (first, first_handle) = start_client(connector.clone(), ok_handler());
    let mut first_events = first.subscribe();
    let first_id = wait_registered(&mut first_events).await;

    let (second, _second_handle) = start_client(connector.clone(), Arc::new(EchoHandler));
    let second_id = wait_registered(&mut second.subscribe()).await;
    assert_ne!(first_id, second_id);

    let exit = tokio::time::timeout(Duration::from_secs(5), first_handle)
        .await
        .expect("superseded client kept running")
        .unwrap();
    assert_eq!(exit, ClientExit::Superseded);
    assert_eq!(
        relay.active_client().map(|c| c.client_id),
        Some(second_id)
    );

    // Requests now reach the second client only.
    let stub = Stub::with_env(connector, StubConfig::new("fn-b"), BTreeMap::new());
    let response = stub
        .invoke(json!({"n": 1}), context("req-b"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response["functionId"], "fn-b");
}

#[tokio::test]
async fn test_large_payload_travels_by_pointer() {
    let relay = Arc::new(Relay::new());
    let store = Arc::new(MemoryBlobStore::new());
    let connector = Arc::new(MemoryConnector::new(relay).with_store(store.clone()));
    let (client, _handle) = start_client(connector.clone(), Arc::new(EchoHandler));
    wait_registered(&mut client.subscribe()).await;

    let stub = Stub::with_env(connector, StubConfig::new("fn-big"), BTreeMap::new());
    let blob = "z".repeat(5 * 1024 * 1024);
    let response = stub
        .invoke(json!({"blob": blob}), context("req-big"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(response["event"]["blob"].as_str().map(str::len), Some(blob.len()));
    // Request and response were both offloaded.
    assert_eq!(store.len().await, 2);
}
