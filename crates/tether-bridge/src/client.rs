// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local bridge client.
//!
//! Registers with the relay, receives invocation requests and answers
//! them through an [`InvocationHandler`]. Reconnects with exponential
//! backoff unless the relay reports that another client took over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use tether_protocol::{
    BridgeMessage, CloseCode, DeliveryFailure, Envelope, InvocationPayload, InvocationResult,
};

use crate::link::{Connector, Link, LinkSender};
use crate::relay::Delivery;

/// Executes invocations received from the relay
#[async_trait]
pub trait InvocationHandler: Send + Sync + 'static {
    async fn handle(&self, payload: InvocationPayload) -> InvocationResult;
}

/// Timing for the local client
#[derive(Debug, Clone)]
pub struct BridgeClientConfig {
    /// Interval between application-level keepalives
    pub keepalive_interval: Duration,
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Upper bound for the reconnect delay
    pub reconnect_max: Duration,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(60),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Doubling reconnect delay with an upper bound
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Observable client state changes
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Registered { client_id: String },
    /// `notified` is set when the relay's notice arrived before the close.
    Superseded { notified: bool },
    DeliveryFailed {
        debug_request_id: String,
        reason: DeliveryFailure,
    },
    Reconnecting { attempt: u32, delay: Duration },
}

/// Why [`BridgeClient::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    Shutdown,
    /// Another client registered; this one must not reconnect.
    Superseded,
}

enum SessionEnd {
    Shutdown,
    Superseded { notified: bool },
    Lost,
}

/// The local end of the bridge
pub struct BridgeClient {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn InvocationHandler>,
    config: BridgeClientConfig,
    events: broadcast::Sender<ClientEvent>,
    shutdown: Arc<Notify>,
}

impl BridgeClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        handler: Arc<dyn InvocationHandler>,
        config: BridgeClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connector,
            handler,
            config,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Notify this handle to stop the client.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Connect, register and serve invocations until shut down or superseded.
    pub async fn run(&self) -> ClientExit {
        let mut backoff = Backoff::new(self.config.reconnect_initial, self.config.reconnect_max);
        let mut attempt = 0u32;

        loop {
            let end = match self.connector.connect().await {
                Ok(link) => self.session(link, &mut backoff).await,
                Err(e) => {
                    warn!(error = %e, "failed to connect to relay");
                    SessionEnd::Lost
                }
            };

            match end {
                SessionEnd::Shutdown => {
                    info!("bridge client shutting down");
                    return ClientExit::Shutdown;
                }
                SessionEnd::Superseded { notified } => {
                    warn!(notified, "another client registered, not reconnecting");
                    self.emit(ClientEvent::Superseded { notified });
                    return ClientExit::Superseded;
                }
                SessionEnd::Lost => {}
            }

            attempt += 1;
            let delay = backoff.next_delay();
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to relay");
            self.emit(ClientEvent::Reconnecting { attempt, delay });

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return ClientExit::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&self, link: Link, backoff: &mut Backoff) -> SessionEnd {
        let Link {
            sender,
            mut inbound,
        } = link;

        if let Err(e) = sender.send(BridgeMessage::Register).await {
            warn!(error = %e, "failed to register");
            return SessionEnd::Lost;
        }

        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    sender.close(CloseCode::Normal).await;
                    return SessionEnd::Shutdown;
                }
                delivery = inbound.recv() => match delivery {
                    None => return SessionEnd::Lost,
                    Some(Delivery::Close { code: CloseCode::Superseded, .. }) => {
                        return SessionEnd::Superseded { notified: false };
                    }
                    Some(Delivery::Close { code, reason }) => {
                        warn!(code = code.as_u32(), %reason, "relay closed the connection");
                        return SessionEnd::Lost;
                    }
                    Some(Delivery::Message(message)) => match message {
                        BridgeMessage::Registered { client_id } => {
                            info!(%client_id, "registered with relay");
                            backoff.reset();
                            self.emit(ClientEvent::Registered { client_id });
                        }
                        BridgeMessage::DisconnectedSuperseded => {
                            return SessionEnd::Superseded { notified: true };
                        }
                        BridgeMessage::InvocationRequest(envelope) => {
                            self.spawn_invocation(sender.clone(), envelope);
                        }
                        BridgeMessage::DeliveryFailed { debug_request_id, reason } => {
                            warn!(%debug_request_id, ?reason, "response was not delivered");
                            self.emit(ClientEvent::DeliveryFailed { debug_request_id, reason });
                        }
                        other => debug!(action = other.action(), "ignoring message"),
                    },
                },
                _ = keepalive.tick() => {
                    if let Err(e) = sender.send(BridgeMessage::Keepalive).await {
                        warn!(error = %e, "keepalive failed");
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    fn spawn_invocation(&self, sender: Arc<dyn LinkSender>, envelope: Envelope) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let debug_request_id = envelope.debug_request_id.clone();
            let result = match decode_payload(&envelope) {
                Ok(payload) => {
                    debug!(%debug_request_id, function_id = %payload.function_id, "invocation received");
                    handler.handle(payload).await
                }
                Err(message) => {
                    warn!(%debug_request_id, %message, "invalid invocation payload");
                    InvocationResult::failure("Runtime.InvalidPayload", message)
                }
            };

            let body = match serde_json::to_value(&result) {
                Ok(body) => body,
                Err(e) => {
                    error!(%debug_request_id, error = %e, "failed to serialize result");
                    return;
                }
            };
            let mut response = Envelope::inline(debug_request_id.clone(), body);
            response.reply_to = envelope.reply_to;
            if let Err(e) = sender
                .send(BridgeMessage::InvocationResponse(response))
                .await
            {
                warn!(%debug_request_id, error = %e, "failed to send response");
            }
        });
    }
}

fn decode_payload(envelope: &Envelope) -> Result<InvocationPayload, String> {
    let Some(payload) = &envelope.payload else {
        return Err("request payload was not resolved".to_string());
    };
    serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
}
