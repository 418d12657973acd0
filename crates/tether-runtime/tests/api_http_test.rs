// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP tests for the Runtime-API emulator on a loopback port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};

use tether_protocol::InvocationContext;
use tether_runtime::api::{HEADER_DEADLINE_MS, HEADER_FUNCTION_ARN, HEADER_REQUEST_ID};
use tether_runtime::{Invocation, RuntimeApi, RuntimeEvent};

struct Server {
    api: Arc<RuntimeApi>,
    events: mpsc::UnboundedReceiver<RuntimeEvent>,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
}

async fn start() -> Server {
    let (api, events) = RuntimeApi::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(api.clone().serve(listener, shutdown.clone()));
    Server {
        api,
        events,
        addr,
        shutdown,
    }
}

fn invocation(id: &str) -> Invocation {
    Invocation {
        request_id: id.to_string(),
        event: json!({"path": "/orders", "body": "b".repeat(2048)}),
        context: InvocationContext {
            aws_request_id: id.to_string(),
            invoked_function_arn: "arn:aws:lambda:eu-central-1:123456789012:function:api".to_string(),
            client_context: Some(json!({"app": "web"})),
            ..Default::default()
        },
        deadline_ms: 1_700_000_003_000,
    }
}

#[tokio::test]
async fn test_next_returns_event_with_headers() {
    let mut server = start().await;
    server.api.enqueue("w1", invocation("abc-123"));

    let response = reqwest::get(format!(
        "http://{}/w1/2018-06-01/runtime/invocation/next",
        server.addr
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let headers = response.headers().clone();
    assert_eq!(headers[HEADER_REQUEST_ID], "abc-123");
    assert_eq!(headers[HEADER_DEADLINE_MS], "1700000003000");
    assert_eq!(
        headers[HEADER_FUNCTION_ARN],
        "arn:aws:lambda:eu-central-1:123456789012:function:api"
    );
    assert_eq!(headers["lambda-runtime-client-context"], r#"{"app":"web"}"#);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["path"], "/orders");
    assert_eq!(server.api.queued("w1"), 0);

    assert!(matches!(
        server.events.recv().await,
        Some(RuntimeEvent::Invoked { worker_id, .. }) if worker_id == "w1"
    ));
    server.shutdown.notify_one();
}

#[tokio::test]
async fn test_long_poll_waits_for_enqueue() {
    let server = start().await;
    let url = format!("http://{}/w1/runtime/invocation/next", server.addr);
    let poll = tokio::spawn(async move { reqwest::get(url).await.unwrap() });

    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.api.is_waiting("w1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    server.api.enqueue("w1", invocation("late"));
    let response = poll.await.unwrap();
    assert_eq!(response.headers()[HEADER_REQUEST_ID], "late");
}

#[tokio::test]
async fn test_response_and_error_posts_publish_events() {
    let mut server = start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "http://{}/w1/runtime/invocation/abc-123/response",
            server.addr
        ))
        .json(&json!({"status": "ok"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    assert_eq!(
        server.events.recv().await,
        Some(RuntimeEvent::Success {
            worker_id: "w1".to_string(),
            request_id: "abc-123".to_string(),
            body: json!({"status": "ok"}),
        })
    );

    client
        .post(format!(
            "http://{}/w1/runtime/invocation/abc-124/error",
            server.addr
        ))
        .json(&json!({
            "errorType": "TypeError",
            "errorMessage": "x is undefined",
            "stackTrace": ["at handler (index.js:1:1)"]
        }))
        .send()
        .await
        .unwrap();
    match server.events.recv().await {
        Some(RuntimeEvent::Error {
            request_id, error, ..
        }) => {
            assert_eq!(request_id, "abc-124");
            assert_eq!(error.error_type, "TypeError");
            assert_eq!(error.stack_trace.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    client
        .post(format!("http://{}/w1/runtime/init/error", server.addr))
        .json(&json!({"errorType": "Runtime.ImportModuleError", "errorMessage": "no module"}))
        .send()
        .await
        .unwrap();
    assert!(matches!(
        server.events.recv().await,
        Some(RuntimeEvent::InitError { error, .. }) if error.error_type == "Runtime.ImportModuleError"
    ));
}

#[tokio::test]
async fn test_removed_worker_poll_is_released() {
    let server = start().await;
    let url = format!("http://{}/w1/runtime/invocation/next", server.addr);
    let poll = tokio::spawn(async move { reqwest::get(url).await.unwrap() });

    while !server.api.is_waiting("w1") {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.api.remove_worker("w1");
    assert_eq!(poll.await.unwrap().status(), 410);
}
