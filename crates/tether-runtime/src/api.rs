// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local Runtime-API emulator.
//!
//! Serves the invocation-polling protocol a worker's runtime client
//! expects. Every worker gets its own path prefix, so workers find the
//! API through `AWS_LAMBDA_RUNTIME_API=<host>:<port>/<worker_id>`.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/{worker_id}/runtime/invocation/next` | Long-poll for the next invocation |
//! | POST | `/{worker_id}/runtime/invocation/{request_id}/response` | Report success |
//! | POST | `/{worker_id}/runtime/invocation/{request_id}/error` | Report a handler error |
//! | POST | `/{worker_id}/runtime/init/error` | Report an initialization error |
//!
//! The same routes are served under `/{worker_id}/2018-06-01/runtime/...`
//! for runtime clients that include the API version in the path.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tether_protocol::{InvocationContext, InvocationPayload, RemoteError};

pub const HEADER_REQUEST_ID: &str = "lambda-runtime-aws-request-id";
pub const HEADER_DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
pub const HEADER_FUNCTION_ARN: &str = "lambda-runtime-invoked-function-arn";
pub const HEADER_CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
pub const HEADER_COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";
pub const HEADER_LOG_GROUP: &str = "lambda-runtime-log-group-name";
pub const HEADER_LOG_STREAM: &str = "lambda-runtime-log-stream-name";

/// One unit of work for a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub request_id: String,
    pub event: Value,
    pub context: InvocationContext,
    /// Absolute deadline in epoch milliseconds
    pub deadline_ms: u64,
}

impl Invocation {
    /// Build from a relayed payload, turning the remaining budget into an
    /// absolute deadline.
    pub fn from_payload(payload: &InvocationPayload, now_ms: u64) -> Self {
        Self {
            request_id: payload.context.aws_request_id.clone(),
            event: payload.event.clone(),
            context: payload.context.clone(),
            deadline_ms: now_ms + payload.deadline_ms,
        }
    }
}

/// What workers reported through the API
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// An invocation was handed to a polling worker.
    Invoked { worker_id: String, request_id: String },
    Success {
        worker_id: String,
        request_id: String,
        body: Value,
    },
    Error {
        worker_id: String,
        request_id: String,
        error: RemoteError,
    },
    InitError { worker_id: String, error: RemoteError },
}

#[derive(Default)]
struct Slot {
    queue: VecDeque<Invocation>,
    waiter: Option<oneshot::Sender<Invocation>>,
}

/// Per-worker invocation queues plus parked long-polls
pub struct RuntimeApi {
    slots: Mutex<HashMap<String, Slot>>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

impl RuntimeApi {
    /// Create the API and the receiver for worker reports.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let api = Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            events,
        });
        (api, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RuntimeEvent) {
        if self.events.send(event).is_err() {
            debug!("runtime event dropped, no consumer");
        }
    }

    /// Hand an invocation to a worker, waking its parked poll if there is one.
    pub fn enqueue(&self, worker_id: &str, invocation: Invocation) {
        let mut slots = self.lock();
        let slot = slots.entry(worker_id.to_string()).or_default();
        let request_id = invocation.request_id.clone();

        let invocation = match slot.waiter.take() {
            Some(waiter) => match waiter.send(invocation) {
                Ok(()) => {
                    drop(slots);
                    self.emit(RuntimeEvent::Invoked {
                        worker_id: worker_id.to_string(),
                        request_id,
                    });
                    return;
                }
                // The poll went away; keep the invocation for the next one.
                Err(invocation) => invocation,
            },
            None => invocation,
        };
        slot.queue.push_back(invocation);
        debug!(worker_id, %request_id, queued = slot.queue.len(), "invocation queued");
    }

    /// Wait for the next invocation for `worker_id`.
    ///
    /// Returns `None` when the worker is removed while waiting.
    pub async fn next(&self, worker_id: &str) -> Option<Invocation> {
        let rx = {
            let mut slots = self.lock();
            let slot = slots.entry(worker_id.to_string()).or_default();
            if let Some(invocation) = slot.queue.pop_front() {
                drop(slots);
                self.emit(RuntimeEvent::Invoked {
                    worker_id: worker_id.to_string(),
                    request_id: invocation.request_id.clone(),
                });
                return Some(invocation);
            }
            let (tx, rx) = oneshot::channel();
            if slot.waiter.replace(tx).is_some() {
                debug!(worker_id, "replacing parked poll");
            }
            rx
        };
        rx.await.ok()
    }

    /// Invocations waiting for `worker_id` to poll
    pub fn queued(&self, worker_id: &str) -> usize {
        self.lock().get(worker_id).map_or(0, |slot| slot.queue.len())
    }

    /// Whether `worker_id` has a poll parked right now
    pub fn is_waiting(&self, worker_id: &str) -> bool {
        self.lock()
            .get(worker_id)
            .and_then(|slot| slot.waiter.as_ref())
            .is_some_and(|waiter| !waiter.is_closed())
    }

    /// Forget a worker, releasing its parked poll. Returns unclaimed invocations.
    pub fn remove_worker(&self, worker_id: &str) -> Vec<Invocation> {
        self.lock()
            .remove(worker_id)
            .map(|slot| slot.queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Record a successful result.
    pub fn respond(&self, worker_id: &str, request_id: &str, body: Value) {
        self.emit(RuntimeEvent::Success {
            worker_id: worker_id.to_string(),
            request_id: request_id.to_string(),
            body,
        });
    }

    /// Record a handler error.
    pub fn fail(&self, worker_id: &str, request_id: &str, error: RemoteError) {
        self.emit(RuntimeEvent::Error {
            worker_id: worker_id.to_string(),
            request_id: request_id.to_string(),
            error,
        });
    }

    /// Record an initialization error.
    pub fn init_failed(&self, worker_id: &str, error: RemoteError) {
        self.emit(RuntimeEvent::InitError {
            worker_id: worker_id.to_string(),
            error,
        });
    }

    /// HTTP routes for the emulator
    pub fn router(self: Arc<Self>) -> Router {
        let runtime = Router::new()
            .route("/invocation/next", get(next_invocation))
            .route("/invocation/{request_id}/response", post(post_response))
            .route("/invocation/{request_id}/error", post(post_error))
            .route("/init/error", post(post_init_error));

        Router::new()
            .nest("/{worker_id}/runtime", runtime.clone())
            .nest("/{worker_id}/2018-06-01/runtime", runtime)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Serve the emulator until `shutdown` is notified.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: Arc<Notify>) -> std::io::Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(%addr, "Runtime API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
    }
}

type ApiState = State<Arc<RuntimeApi>>;

async fn next_invocation(State(api): ApiState, Path(worker_id): Path<String>) -> Response {
    let Some(invocation) = api.next(&worker_id).await else {
        debug!(%worker_id, "poll released, worker removed");
        return (
            StatusCode::GONE,
            axum::Json(json!({"errorMessage": "worker stopped", "errorType": "Runtime.WorkerStopped"})),
        )
            .into_response();
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, HEADER_REQUEST_ID, &invocation.request_id);
    insert_header(&mut headers, HEADER_DEADLINE_MS, &invocation.deadline_ms.to_string());
    insert_header(&mut headers, HEADER_FUNCTION_ARN, &invocation.context.invoked_function_arn);
    insert_header(&mut headers, HEADER_LOG_GROUP, &invocation.context.log_group_name);
    insert_header(&mut headers, HEADER_LOG_STREAM, &invocation.context.log_stream_name);
    if let Some(client_context) = &invocation.context.client_context {
        insert_header(&mut headers, HEADER_CLIENT_CONTEXT, &client_context.to_string());
    }
    if let Some(identity) = &invocation.context.identity {
        insert_header(&mut headers, HEADER_COGNITO_IDENTITY, &identity.to_string());
    }

    (StatusCode::OK, headers, axum::Json(invocation.event)).into_response()
}

async fn post_response(
    State(api): ApiState,
    Path((worker_id, request_id)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    debug!(%worker_id, %request_id, size = body.len(), "invocation response");
    api.respond(&worker_id, &request_id, parse_body(&body));
    accepted()
}

async fn post_error(
    State(api): ApiState,
    Path((worker_id, request_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let error = parse_error(&headers, &body);
    debug!(%worker_id, %request_id, error_type = %error.error_type, "invocation error");
    api.fail(&worker_id, &request_id, error);
    accepted()
}

async fn post_init_error(
    State(api): ApiState,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let error = parse_error(&headers, &body);
    warn!(%worker_id, error_type = %error.error_type, "worker failed to initialize");
    api.init_failed(&worker_id, error);
    accepted()
}

fn accepted() -> (StatusCode, axum::Json<Value>) {
    (StatusCode::ACCEPTED, axum::Json(json!({"status": "OK"})))
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if value.is_empty() {
        return;
    }
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!(header = name, "dropping header with invalid characters"),
    }
}

/// Handler results are usually JSON; anything else is kept as a string.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn parse_error(headers: &HeaderMap, body: &[u8]) -> RemoteError {
    if let Ok(error) = serde_json::from_slice::<RemoteError>(body) {
        return error;
    }
    let error_type = headers
        .get("lambda-runtime-function-error-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("Runtime.Unknown");
    RemoteError::new(error_type, String::from_utf8_lossy(body))
}
