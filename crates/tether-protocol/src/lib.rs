// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Protocol - bridge wire format and QUIC transport
//!
//! This crate provides the wire protocol spoken between:
//! - Deployed stubs and the bridge relay
//! - The local development client and the bridge relay
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    tether-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: JSON objects tagged by `action`                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Codec: fragments + blob pointers for oversized bodies      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), one bidirectional stream per peer │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tether_protocol::{BridgeMessage, CodecConfig, MessageDecoder, MessageEncoder, TetherClient};
//!
//! let client = TetherClient::localhost("127.0.0.1:8710".parse()?)?;
//! let (mut send, mut recv) = client.open_framed().await?;
//!
//! let encoder = MessageEncoder::new(CodecConfig::default());
//! send.write_all(&encoder.encode(&BridgeMessage::Register).await?).await?;
//!
//! let mut decoder = MessageDecoder::new(&CodecConfig::default());
//! loop {
//!     if let Some(message) = decoder.decode(recv.read_fragment().await?).await? {
//!         println!("{}", message.action());
//!         break;
//!     }
//! }
//! ```

pub mod blob;
pub mod client;
pub mod codec;
pub mod frame;
pub mod message;
pub mod server;

pub use blob::{BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use client::{ClientError, TetherClient, TetherClientConfig};
pub use codec::{CodecConfig, CodecError, MessageDecoder, MessageEncoder};
pub use frame::{Fragment, FrameError, FramedStream, Reassembler};
pub use message::{
    BridgeMessage, CloseCode, ConnectionId, DeliveryFailure, Envelope, InvocationContext,
    InvocationPayload, InvocationResult, RemoteError,
};
pub use server::{ConnectionHandler, ServerError, TetherServer, TetherServerConfig};
