// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bridge tests against a relay served over loopback QUIC.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use tether_bridge::{
    BridgeClient, BridgeClientConfig, ClientEvent, ClientExit, InvocationHandler, QuicConnector,
    Relay, RelayServer, Stub, StubConfig,
};
use tether_protocol::{
    BlobStore, CodecConfig, FsBlobStore, InvocationContext, InvocationPayload, InvocationResult,
    TetherClientConfig, TetherServer,
};

struct OkHandler;

/// Reports the size of the event it received.
struct SizeHandler;

#[async_trait]
impl InvocationHandler for SizeHandler {
    async fn handle(&self, payload: InvocationPayload) -> InvocationResult {
        let size = payload.event["payload"].as_str().map_or(0, str::len);
        InvocationResult::Success {
            body: json!({"size": size}),
        }
    }
}

#[async_trait]
impl InvocationHandler for OkHandler {
    async fn handle(&self, _payload: InvocationPayload) -> InvocationResult {
        InvocationResult::Success {
            body: json!({"status": "ok"}),
        }
    }
}

async fn start_relay() -> (Arc<RelayServer>, SocketAddr) {
    let server = TetherServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
    let relay_server = Arc::new(RelayServer::new(
        server,
        Arc::new(Relay::new()),
        CodecConfig::default(),
    ));
    let addr = relay_server.local_addr().unwrap();
    let running = relay_server.clone();
    tokio::spawn(async move { running.run().await });
    (relay_server, addr)
}

fn connector_config(addr: SocketAddr) -> QuicConnector {
    QuicConnector::new(TetherClientConfig {
        server_addr: addr,
        dangerous_skip_cert_verification: true,
        ..Default::default()
    })
}

fn connector(addr: SocketAddr) -> Arc<QuicConnector> {
    Arc::new(connector_config(addr))
}

fn client(addr: SocketAddr) -> Arc<BridgeClient> {
    Arc::new(BridgeClient::new(
        connector(addr),
        Arc::new(OkHandler),
        BridgeClientConfig::default(),
    ))
}

async fn registered(client: &Arc<BridgeClient>) -> tokio::task::JoinHandle<ClientExit> {
    let mut events = client.subscribe();
    let running = client.clone();
    let handle = tokio::spawn(async move { running.run().await });
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::Registered { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("client did not register");
    handle
}

#[tokio::test]
async fn test_invocation_over_quic() {
    let (server, addr) = start_relay().await;
    let local = client(addr);
    let _handle = registered(&local).await;

    let stub = Stub::with_env(connector(addr), StubConfig::new("fn-api"), BTreeMap::new());
    let context = InvocationContext {
        aws_request_id: "abc-123".to_string(),
        ..Default::default()
    };
    let response = stub
        .invoke(
            json!({"payload": "p".repeat(100 * 1024)}),
            context,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"status": "ok"}));

    server.close();
}

#[tokio::test]
async fn test_superseded_client_stops_over_quic() {
    let (server, addr) = start_relay().await;

    let first = client(addr);
    let first_handle = registered(&first).await;
    let mut first_events = first.subscribe();
    let second = client(addr);
    let _second_handle = registered(&second).await;

    let exit = tokio::time::timeout(Duration::from_secs(5), first_handle)
        .await
        .expect("first client did not stop")
        .unwrap();
    assert_eq!(exit, ClientExit::Superseded);

    // The notice must be decoded, not inferred from the close code
    let superseded = loop {
        match first_events.try_recv() {
            Ok(ClientEvent::Superseded { notified }) => break notified,
            Ok(_) => continue,
            Err(e) => panic!("no superseded event: {e}"),
        }
    };
    assert!(superseded);

    server.close();
}

#[tokio::test]
async fn test_oversized_event_travels_as_pointer() {
    let (server, addr) = start_relay().await;
    let blobs = TempDir::new().unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(blobs.path()));

    let local = Arc::new(BridgeClient::new(
        Arc::new(connector_config(addr).with_store(store.clone())),
        Arc::new(SizeHandler),
        BridgeClientConfig::default(),
    ));
    let _handle = registered(&local).await;

    let stub = Stub::with_env(
        Arc::new(connector_config(addr).with_store(store)),
        StubConfig::new("fn-upload"),
        BTreeMap::new(),
    );
    let context = InvocationContext {
        aws_request_id: "big-1".to_string(),
        ..Default::default()
    };
    let response = stub
        .invoke(
            json!({"payload": "u".repeat(2 * 1024 * 1024)}),
            context,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"size": 2 * 1024 * 1024}));

    let stored = std::fs::read_dir(blobs.path().join("payloads"))
        .unwrap()
        .count();
    assert!(stored >= 1);

    server.close();
}

#[tokio::test]
async fn test_oversized_event_travels_inline_without_store() {
    let (server, addr) = start_relay().await;
    let local = Arc::new(BridgeClient::new(
        connector(addr),
        Arc::new(SizeHandler),
        BridgeClientConfig::default(),
    ));
    let _handle = registered(&local).await;

    let stub = Stub::with_env(connector(addr), StubConfig::new("fn-upload"), BTreeMap::new());
    let context = InvocationContext {
        aws_request_id: "big-2".to_string(),
        ..Default::default()
    };
    let response = stub
        .invoke(
            json!({"payload": "i".repeat(2 * 1024 * 1024)}),
            context,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"size": 2 * 1024 * 1024}));

    server.close();
}
