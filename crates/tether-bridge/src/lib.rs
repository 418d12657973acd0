// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Bridge - relay between deployed stubs and the local client
//!
//! The bridge pairs exactly one registered local client with every stub
//! connection. Stubs forward invocations; the client runs them and sends
//! the result back; the relay routes the result to the stub that asked.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌──────────────────┐
//! │  Stub (cloud)   │  invocation-request          │  Local client    │
//! │  Stub::invoke   │─────────┐          ┌────────►│  BridgeClient    │
//! └─────────────────┘         ▼          │         └────────┬─────────┘
//!          ▲             ┌──────────────────┐               │
//!          │             │      Relay       │◄──────────────┘
//!          └─────────────│  (tether-relay)  │  invocation-response
//!   invocation-response  └──────────────────┘
//! ```
//!
//! # Messages
//!
//! | Action | Sender | Description |
//! |--------|--------|-------------|
//! | `register` | client | Become the active client |
//! | `registered` | relay | Registration accepted, carries `clientId` |
//! | `disconnected-superseded` | relay | Another client registered; close code 4901 follows |
//! | `invocation-request` | stub, relay | Forwarded to the active client with `replyTo` |
//! | `invocation-response` | client, relay | Routed back to `replyTo` |
//! | `no-client-connected` | relay | No active client for a request |
//! | `delivery-failed` | relay | A response could not reach its stub |
//! | `keepalive` | any | Keeps idle connections open |
//!
//! # Single Active Client
//!
//! Registering while another client is active sends the old client
//! `disconnected-superseded`, closes its connection with
//! [`CloseCode::Superseded`](tether_protocol::CloseCode::Superseded) and
//! makes the new client the only recipient of requests. A superseded
//! [`BridgeClient`] returns [`ClientExit::Superseded`] instead of
//! reconnecting.
//!
//! # Transports
//!
//! [`quic::RelayServer`] serves the relay over QUIC and
//! [`quic::QuicConnector`] connects peers to it. [`link::MemoryConnector`]
//! attaches peers to an in-process relay and still runs every message
//! through the fragment codec.

pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod quic;
pub mod relay;
pub mod stub;

pub use client::{
    Backoff, BridgeClient, BridgeClientConfig, ClientEvent, ClientExit, InvocationHandler,
};
pub use config::{ConfigError, RelayConfig};
pub use error::{BridgeError, Result};
pub use link::{Connector, Link, LinkSender, MemoryConnector};
pub use quic::{QuicConnector, RelayServer};
pub use relay::{ActiveClient, Delivery, Relay};
pub use stub::{RelayOutcome, Stub, StubConfig};
