// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The stub adapter.
//!
//! Runs inside the deployed function. Each invocation is forwarded to the
//! relay and the stub waits for the correlated response, a
//! `no-client-connected` notice, or its own deadline, whichever comes
//! first.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep_until};
use tracing::{debug, info, warn};

use tether_protocol::{
    BridgeMessage, CloseCode, Envelope, InvocationContext, InvocationPayload, InvocationResult,
    RemoteError,
};

use crate::error::Result;
use crate::link::{Connector, Link, LinkSender};
use crate::relay::Delivery;

/// Platform variables that are never forwarded to local workers.
pub const IGNORED_ENV: &[&str] = &[
    "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
    "AWS_LAMBDA_LOG_GROUP_NAME",
    "AWS_LAMBDA_LOG_STREAM_NAME",
    "LD_LIBRARY_PATH",
    "LAMBDA_TASK_ROOT",
    "AWS_LAMBDA_RUNTIME_API",
    "AWS_EXECUTION_ENV",
    "AWS_XRAY_DAEMON_ADDRESS",
    "AWS_XRAY_CONTEXT_MISSING",
    "_AWS_XRAY_DAEMON_ADDRESS",
    "_AWS_XRAY_DAEMON_PORT",
    "_X_AMZN_TRACE_ID",
    "AWS_LAMBDA_INITIALIZATION_TYPE",
    "PATH",
    "PWD",
    "LAMBDA_RUNTIME_DIR",
    "LANG",
    "NODE_PATH",
    "NODE_EXTRA_CA_CERTS",
    "TZ",
    "SHLVL",
    "_HANDLER",
];

/// Prefix of the stub's own settings, also kept local.
const STUB_ENV_PREFIX: &str = "TETHER_";

const NO_CLIENT_MESSAGE: &str =
    "No local client is connected. Start the dev session to handle this invocation.";
const TIMEOUT_MESSAGE: &str =
    "The local client did not respond before the function timed out.";

/// Stub settings
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Function the stub stands in for
    pub function_id: String,
    /// Keepalive period while a response is outstanding
    pub keepalive_interval: Duration,
    /// Reopen the relay connection once it is older than this
    pub connection_lifespan: Duration,
    /// Give up this long before the platform deadline
    pub timeout_margin: Duration,
    /// Added to the deadline when building correlation ids
    pub expiry_buffer: Duration,
}

impl StubConfig {
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            keepalive_interval: Duration::from_secs(540),
            connection_lifespan: Duration::from_secs(30 * 60),
            timeout_margin: Duration::from_secs(1),
            expiry_buffer: Duration::from_secs(1),
        }
    }
}

/// How a forwarded invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Success(Value),
    Failure(RemoteError),
    NoClientConnected,
    Timeout,
    /// The relay connection went away before an answer arrived.
    Disconnected(String),
}

/// Drop platform-internal variables from an environment snapshot.
pub fn filtered_environment(
    vars: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter(|(key, _)| {
            !key.starts_with(STUB_ENV_PREFIX) && !IGNORED_ENV.contains(&key.as_str())
        })
        .collect()
}

/// Correlation id: the caller's request id plus the epoch-ms expiry.
pub fn correlation_id(request_id: &str, now_ms: u64, remaining: Duration, buffer: Duration) -> String {
    let expiry = now_ms + remaining.as_millis() as u64 + buffer.as_millis() as u64;
    format!("{request_id}-{expiry}")
}

/// The response returned to the caller when the local side is unreachable.
pub fn diagnostic_response(message: &str) -> Value {
    json!({
        "statusCode": 500,
        "body": message,
    })
}

enum StubReply {
    Response(InvocationResult),
    NoClient,
    Closed(String),
}

type PendingMap = HashMap<String, (u64, oneshot::Sender<StubReply>)>;

#[derive(Default, Clone)]
struct Pending(Arc<StdMutex<PendingMap>>);

impl Pending {
    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: String, generation: u64, tx: oneshot::Sender<StubReply>) {
        self.lock().insert(id, (generation, tx));
    }

    fn remove(&self, id: &str) -> Option<oneshot::Sender<StubReply>> {
        self.lock().remove(id).map(|(_, tx)| tx)
    }

    fn resolve(&self, id: &str, reply: StubReply) {
        match self.remove(id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(debug_request_id = %id, "discarding reply for unknown request"),
        }
    }

    /// Fail every request sent on one connection generation.
    fn fail_generation(&self, generation: u64, reason: &str) {
        let mut pending = self.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, (g, _))| *g == generation)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(StubReply::Closed(reason.to_string()));
            }
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct StubConnection {
    sender: Arc<dyn LinkSender>,
    opened_at: Instant,
    reader: JoinHandle<()>,
    generation: u64,
}

/// Forwards invocations to the local client through the relay
pub struct Stub {
    connector: Arc<dyn Connector>,
    config: StubConfig,
    env: BTreeMap<String, String>,
    connection: Mutex<Option<StubConnection>>,
    pending: Pending,
    generations: AtomicU64,
}

impl Stub {
    /// Create a stub forwarding the current process environment.
    pub fn new(connector: Arc<dyn Connector>, config: StubConfig) -> Self {
        Self::with_env(connector, config, filtered_environment(std::env::vars()))
    }

    pub fn with_env(
        connector: Arc<dyn Connector>,
        config: StubConfig,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            connector,
            config,
            env,
            connection: Mutex::new(None),
            pending: Pending::default(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StubConfig {
        &self.config
    }

    /// Number of invocations waiting for an answer
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Current connection, reopened when closed or past its lifespan.
    async fn connection(&self) -> Result<(Arc<dyn LinkSender>, u64)> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref()
            && !conn.reader.is_finished()
            && conn.opened_at.elapsed() < self.config.connection_lifespan
        {
            return Ok((conn.sender.clone(), conn.generation));
        }

        if let Some(old) = slot.take() {
            debug!(generation = old.generation, "retiring relay connection");
            old.sender.close(CloseCode::Normal).await;
        }

        let Link { sender, inbound } = self.connector.connect().await?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let reader = tokio::spawn(read_replies(inbound, self.pending.clone(), generation));
        info!(generation, "opened relay connection");

        *slot = Some(StubConnection {
            sender: sender.clone(),
            opened_at: Instant::now(),
            reader,
            generation,
        });
        Ok((sender, generation))
    }

    /// Forward one invocation and wait for its outcome.
    pub async fn forward(
        &self,
        event: Value,
        context: InvocationContext,
        remaining: Duration,
    ) -> Result<RelayOutcome> {
        let started = Instant::now();
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let id = correlation_id(
            &context.aws_request_id,
            now_ms,
            remaining,
            self.config.expiry_buffer,
        );

        let payload = InvocationPayload {
            function_id: self.config.function_id.clone(),
            event,
            context,
            deadline_ms: remaining.as_millis() as u64,
            env: self.env.clone(),
        };
        let message =
            BridgeMessage::InvocationRequest(Envelope::inline(id.clone(), serde_json::to_value(&payload)?));

        let (sender, generation) = self.connection().await?;
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(id.clone(), generation, tx);

        if let Err(e) = sender.send(message).await {
            self.pending.remove(&id);
            warn!(debug_request_id = %id, error = %e, "failed to send invocation");
            return Ok(RelayOutcome::Disconnected(e.to_string()));
        }
        debug!(debug_request_id = %id, "invocation forwarded");

        let deadline = started + remaining.saturating_sub(self.config.timeout_margin);
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(started + period, period);

        let outcome = loop {
            tokio::select! {
                biased;
                reply = &mut rx => break match reply {
                    Ok(StubReply::Response(InvocationResult::Success { body })) => RelayOutcome::Success(body),
                    Ok(StubReply::Response(InvocationResult::Failure { error })) => RelayOutcome::Failure(error),
                    Ok(StubReply::NoClient) => RelayOutcome::NoClientConnected,
                    Ok(StubReply::Closed(reason)) => RelayOutcome::Disconnected(reason),
                    Err(_) => RelayOutcome::Disconnected("reply channel dropped".to_string()),
                },
                _ = sleep_until(deadline) => {
                    warn!(debug_request_id = %id, "invocation timed out");
                    break RelayOutcome::Timeout;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = sender.send(BridgeMessage::Keepalive).await {
                        debug!(error = %e, "keepalive failed");
                    }
                }
            }
        };

        self.pending.remove(&id);
        Ok(outcome)
    }

    /// Entry point for the deployed function.
    ///
    /// Handler failures come back as `Err` with the remote error so the
    /// caller sees the same failure a local throw would produce. Transport
    /// problems resolve to a diagnostic response instead.
    pub async fn invoke(
        &self,
        event: Value,
        context: InvocationContext,
        remaining: Duration,
    ) -> std::result::Result<Value, RemoteError> {
        match self.forward(event, context, remaining).await {
            Ok(RelayOutcome::Success(body)) => Ok(body),
            Ok(RelayOutcome::Failure(error)) => Err(error),
            Ok(RelayOutcome::NoClientConnected) => Ok(diagnostic_response(NO_CLIENT_MESSAGE)),
            Ok(RelayOutcome::Timeout) => Ok(diagnostic_response(TIMEOUT_MESSAGE)),
            Ok(RelayOutcome::Disconnected(reason)) => Ok(diagnostic_response(&format!(
                "Lost the connection to the relay: {reason}"
            ))),
            Err(e) => Ok(diagnostic_response(&format!(
                "Could not reach the relay: {e}"
            ))),
        }
    }
}

async fn read_replies(
    mut inbound: mpsc::UnboundedReceiver<Delivery>,
    pending: Pending,
    generation: u64,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(Delivery::Message(BridgeMessage::InvocationResponse(envelope))) => {
                let result = match &envelope.payload {
                    Some(body) => serde_json::from_value(body.clone()).unwrap_or_else(|e| {
                        InvocationResult::failure("Runtime.InvalidResponse", e.to_string())
                    }),
                    None => InvocationResult::failure(
                        "Runtime.InvalidResponse",
                        "response payload was not resolved",
                    ),
                };
                pending.resolve(&envelope.debug_request_id, StubReply::Response(result));
            }
            Some(Delivery::Message(BridgeMessage::NoClientConnected { debug_request_id })) => {
                info!(%debug_request_id, "no local client connected");
                pending.resolve(&debug_request_id, StubReply::NoClient);
            }
            Some(Delivery::Message(other)) => {
                debug!(action = other.action(), "ignoring message");
            }
            Some(Delivery::Close { code, reason }) => {
                break format!("closed with code {}: {reason}", code.as_u32());
            }
            None => break "connection closed".to_string(),
        }
    };
    debug!(generation, %reason, "relay connection finished");
    pending.fail_generation(generation, &reason);
}
