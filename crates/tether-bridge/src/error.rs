// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tether-bridge.

use thiserror::Error;

use tether_protocol::{ClientError, CodecError, ConnectionId, FrameError, ServerError};

/// Result type using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised by the relay, the stub and the local bridge client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("QUIC client error: {0}")]
    Client(#[from] ClientError),

    #[error("QUIC server error: {0}")]
    Server(#[from] ServerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection is not (or no longer) attached to the relay.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// A peer sent a message only the relay is allowed to send.
    #[error("unexpected '{action}' message from {from}")]
    UnexpectedMessage {
        action: &'static str,
        from: ConnectionId,
    },

    #[error("link to the relay is closed")]
    LinkClosed,
}
