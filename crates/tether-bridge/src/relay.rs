// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The bridge relay.
//!
//! Pairs exactly one registered local client with every stub connection.
//! The relay is transport agnostic: each attached connection gets an
//! outbound queue of [`Delivery`] values, and inbound messages are fed to
//! [`Relay::handle`] by whichever transport owns the connection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_protocol::{BridgeMessage, CloseCode, ConnectionId, DeliveryFailure, Envelope};

use crate::error::{BridgeError, Result};

/// Something the relay wants a transport to do on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message(BridgeMessage),
    /// Close the connection; nothing follows on this queue.
    Close { code: CloseCode, reason: String },
}

/// The currently registered local client
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveClient {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub registered_at: DateTime<Utc>,
}

struct Peer {
    outbound: mpsc::UnboundedSender<Delivery>,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    peers: HashMap<ConnectionId, Peer>,
    active_client: Option<ActiveClient>,
}

impl RelayState {
    fn send(&self, to: ConnectionId, message: BridgeMessage) -> bool {
        self.peers
            .get(&to)
            .is_some_and(|peer| peer.outbound.send(Delivery::Message(message)).is_ok())
    }

    fn register(&mut self, from: ConnectionId) {
        let client = ActiveClient {
            connection_id: from,
            client_id: Uuid::new_v4().to_string(),
            registered_at: Utc::now(),
        };
        info!(connection_id = %from, client_id = %client.client_id, "client registered");

        let client_id = client.client_id.clone();
        let previous = self.active_client.replace(client);
        self.send(from, BridgeMessage::Registered { client_id });

        if let Some(previous) = previous
            && previous.connection_id != from
        {
            info!(
                connection_id = %previous.connection_id,
                client_id = %previous.client_id,
                "disconnecting superseded client"
            );
            self.send(previous.connection_id, BridgeMessage::DisconnectedSuperseded);
            if let Some(peer) = self.peers.remove(&previous.connection_id) {
                let _ = peer.outbound.send(Delivery::Close {
                    code: CloseCode::Superseded,
                    reason: "superseded by a new client".to_string(),
                });
            }
        }
    }

    fn forward_request(&mut self, from: ConnectionId, mut envelope: Envelope) {
        envelope.reply_to = Some(from);
        let debug_request_id = envelope.debug_request_id.clone();

        let delivered = match self.active_client.as_ref().map(|c| c.connection_id) {
            Some(client) => {
                let sent = self.send(client, BridgeMessage::InvocationRequest(envelope));
                if !sent {
                    warn!(connection_id = %client, "active client is gone, clearing registration");
                    self.active_client = None;
                    self.peers.remove(&client);
                }
                sent
            }
            None => false,
        };

        if delivered {
            debug!(%debug_request_id, stub = %from, "forwarded invocation to client");
        } else {
            info!(%debug_request_id, stub = %from, "no client connected");
            self.send(from, BridgeMessage::NoClientConnected { debug_request_id });
        }
    }

    fn route_response(&mut self, from: ConnectionId, mut envelope: Envelope) {
        let debug_request_id = envelope.debug_request_id.clone();
        let Some(target) = envelope.reply_to.take() else {
            warn!(%debug_request_id, "response carries no reply-to connection");
            self.send(
                from,
                BridgeMessage::DeliveryFailed {
                    debug_request_id,
                    reason: DeliveryFailure::Unknown,
                },
            );
            return;
        };

        if self.send(target, BridgeMessage::InvocationResponse(envelope)) {
            debug!(%debug_request_id, stub = %target, "routed response to stub");
            return;
        }

        info!(%debug_request_id, stub = %target, "stub disconnected before its response arrived");
        self.peers.remove(&target);
        self.send(
            from,
            BridgeMessage::DeliveryFailed {
                debug_request_id,
                reason: DeliveryFailure::StubDisconnected,
            },
        );
    }
}

/// Relay state shared by every transport connection
#[derive(Default)]
pub struct Relay {
    state: Mutex<RelayState>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new connection and return its id plus outbound queue.
    pub fn attach(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = ConnectionId(state.next_id);
        state.peers.insert(
            id,
            Peer {
                outbound: tx,
                last_seen: Utc::now(),
            },
        );
        debug!(connection_id = %id, "connection attached");
        (id, rx)
    }

    /// Forget a connection. Clears the registration if it was the active client.
    pub fn detach(&self, id: ConnectionId) {
        let mut state = self.lock();
        state.peers.remove(&id);
        if state
            .active_client
            .as_ref()
            .is_some_and(|c| c.connection_id == id)
        {
            info!(connection_id = %id, "active client disconnected");
            state.active_client = None;
        }
        debug!(connection_id = %id, "connection detached");
    }

    /// Process one decoded message received on `from`.
    pub fn handle(&self, from: ConnectionId, message: BridgeMessage) -> Result<()> {
        let mut state = self.lock();
        let peer = state
            .peers
            .get_mut(&from)
            .ok_or(BridgeError::UnknownConnection(from))?;
        peer.last_seen = Utc::now();

        match message {
            BridgeMessage::Register => state.register(from),
            BridgeMessage::InvocationRequest(envelope) => state.forward_request(from, envelope),
            BridgeMessage::InvocationResponse(envelope) => state.route_response(from, envelope),
            BridgeMessage::Keepalive => debug!(connection_id = %from, "keepalive"),
            other @ (BridgeMessage::Registered { .. }
            | BridgeMessage::DisconnectedSuperseded
            | BridgeMessage::NoClientConnected { .. }
            | BridgeMessage::DeliveryFailed { .. }) => {
                warn!(connection_id = %from, action = other.action(), "peer sent a relay-only message");
                return Err(BridgeError::UnexpectedMessage {
                    action: other.action(),
                    from,
                });
            }
        }
        Ok(())
    }

    pub fn active_client(&self) -> Option<ActiveClient> {
        self.lock().active_client.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Last time anything was received on a connection
    pub fn last_seen(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        self.lock().peers.get(&id).map(|peer| peer.last_seen)
    }

    /// Close every connection, e.g. on shutdown.
    pub fn close_all(&self) {
        let mut state = self.lock();
        for (_, peer) in state.peers.drain() {
            let _ = peer.outbound.send(Delivery::Close {
                code: CloseCode::Normal,
                reason: "relay shutting down".to_string(),
            });
        }
        state.active_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expect_message(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> BridgeMessage {
        match rx.try_recv() {
            Ok(Delivery::Message(message)) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    fn register(relay: &Relay) -> (ConnectionId, mpsc::UnboundedReceiver<Delivery>, String) {
        let (id, mut rx) = relay.attach();
        relay.handle(id, BridgeMessage::Register).unwrap();
        match expect_message(&mut rx) {
            BridgeMessage::Registered { client_id } => (id, rx, client_id),
            other => panic!("expected registered, got {:?}", other),
        }
    }

    #[test]
    fn test_register_assigns_client_id() {
        let relay = Relay::new();
        let (id, _rx, client_id) = register(&relay);
        let active = relay.active_client().unwrap();
        assert_eq!(active.connection_id, id);
        assert_eq!(active.client_id, client_id);
    }

    #[test]
    fn test_second_client_supersedes_first() {
        let relay = Relay::new();
        let (a, mut a_rx, _) = register(&relay);
        let (b, _b_rx, _) = register(&relay);

        assert_eq!(expect_message(&mut a_rx), BridgeMessage::DisconnectedSuperseded);
        assert_eq!(
            a_rx.try_recv().unwrap(),
            Delivery::Close {
                code: CloseCode::Superseded,
                reason: "superseded by a new client".to_string()
            }
        );
        assert_eq!(relay.active_client().unwrap().connection_id, b);
        assert!(matches!(
            relay.handle(a, BridgeMessage::Keepalive),
            Err(BridgeError::UnknownConnection(id)) if id == a
        ));
    }

    #[test]
    fn test_reregister_same_connection_keeps_it() {
        let relay = Relay::new();
        let (id, mut rx, first) = register(&relay);
        relay.handle(id, BridgeMessage::Register).unwrap();
        match expect_message(&mut rx) {
            BridgeMessage::Registered { client_id } => assert_ne!(client_id, first),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.connection_count(), 1);
    }

    #[test]
    fn test_request_without_client_gets_no_client_connected() {
        let relay = Relay::new();
        let (stub, mut stub_rx) = relay.attach();
        relay
            .handle(
                stub,
                BridgeMessage::InvocationRequest(Envelope::inline("r-1", json!({}))),
            )
            .unwrap();
        assert_eq!(
            expect_message(&mut stub_rx),
            BridgeMessage::NoClientConnected {
                debug_request_id: "r-1".into()
            }
        );
    }

    #[test]
    fn test_request_forwarded_with_reply_to_and_response_routed_back() {
        let relay = Relay::new();
        let (client, mut client_rx, _) = register(&relay);
        let (stub, mut stub_rx) = relay.attach();

        relay
            .handle(
                stub,
                BridgeMessage::InvocationRequest(Envelope::inline("r-2", json!({"n": 1}))),
            )
            .unwrap();
        let forwarded = expect_message(&mut client_rx);
        let envelope = forwarded.envelope().unwrap().clone();
        assert_eq!(envelope.reply_to, Some(stub));

        relay
            .handle(
                client,
                BridgeMessage::InvocationResponse(
                    Envelope::inline("r-2", json!({"type": "success", "body": 1}))
                        .with_reply_to(stub),
                ),
            )
            .unwrap();
        let response = expect_message(&mut stub_rx);
        let routed = response.envelope().unwrap();
        assert_eq!(routed.debug_request_id, "r-2");
        assert_eq!(routed.reply_to, None);
    }

    #[test]
    fn test_only_latest_client_receives_requests() {
        let relay = Relay::new();
        let (_a, mut a_rx, _) = register(&relay);
        let (_b, mut b_rx, _) = register(&relay);
        let (stub, _stub_rx) = relay.attach();

        // Drain A's supersede notification and close.
        let _ = a_rx.try_recv();
        let _ = a_rx.try_recv();

        relay
            .handle(
                stub,
                BridgeMessage::InvocationRequest(Envelope::inline("r-3", json!(null))),
            )
            .unwrap();
        assert!(matches!(
            expect_message(&mut b_rx),
            BridgeMessage::InvocationRequest(_)
        ));
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_response_to_departed_stub_reports_stub_disconnected() {
        let relay = Relay::new();
        let (client, mut client_rx, _) = register(&relay);
        let (stub, stub_rx) = relay.attach();
        relay.detach(stub);
        drop(stub_rx);

        relay
            .handle(
                client,
                BridgeMessage::InvocationResponse(
                    Envelope::inline("r-4", json!({})).with_reply_to(stub),
                ),
            )
            .unwrap();
        assert_eq!(
            expect_message(&mut client_rx),
            BridgeMessage::DeliveryFailed {
                debug_request_id: "r-4".into(),
                reason: DeliveryFailure::StubDisconnected
            }
        );
    }

    #[test]
    fn test_response_without_reply_to_reports_unknown() {
        let relay = Relay::new();
        let (client, mut client_rx, _) = register(&relay);
        relay
            .handle(
                client,
                BridgeMessage::InvocationResponse(Envelope::inline("r-5", json!({}))),
            )
            .unwrap();
        assert_eq!(
            expect_message(&mut client_rx),
            BridgeMessage::DeliveryFailed {
                debug_request_id: "r-5".into(),
                reason: DeliveryFailure::Unknown
            }
        );
    }

    #[test]
    fn test_dropped_client_queue_clears_registration() {
        let relay = Relay::new();
        let (_client, client_rx, _) = register(&relay);
        drop(client_rx);
        let (stub, mut stub_rx) = relay.attach();

        relay
            .handle(
                stub,
                BridgeMessage::InvocationRequest(Envelope::inline("r-6", json!({}))),
            )
            .unwrap();
        assert!(matches!(
            expect_message(&mut stub_rx),
            BridgeMessage::NoClientConnected { .. }
        ));
        assert!(relay.active_client().is_none());
    }

    #[test]
    fn test_detach_active_client() {
        let relay = Relay::new();
        let (client, _rx, _) = register(&relay);
        relay.detach(client);
        assert!(relay.active_client().is_none());
        assert_eq!(relay.connection_count(), 0);
    }

    #[test]
    fn test_relay_only_messages_rejected() {
        let relay = Relay::new();
        let (id, _rx) = relay.attach();
        let result = relay.handle(
            id,
            BridgeMessage::Registered {
                client_id: "spoof".into(),
            },
        );
        assert!(matches!(
            result,
            Err(BridgeError::UnexpectedMessage { action: "registered", .. })
        ));
    }

    #[test]
    fn test_keepalive_updates_last_seen() {
        let relay = Relay::new();
        let (id, _rx) = relay.attach();
        let before = relay.last_seen(id).unwrap();
        relay.handle(id, BridgeMessage::Keepalive).unwrap();
        assert!(relay.last_seen(id).unwrap() >= before);
    }

    #[test]
    fn test_close_all() {
        let relay = Relay::new();
        let (_id, mut rx, _) = register(&relay);
        relay.close_all();
        assert!(matches!(
            rx.try_recv(),
            Ok(Delivery::Close {
                code: CloseCode::Normal,
                ..
            })
        ));
        assert!(relay.active_client().is_none());
        assert_eq!(relay.connection_count(), 0);
    }
}
