// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer-side links to the relay.
//!
//! Stubs and the local client talk to the relay through a [`Link`]: a
//! sender half for outgoing messages and a queue of incoming deliveries.
//! [`Connector`] opens links; the QUIC implementation lives in
//! [`crate::quic`], the in-process one here.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use tether_protocol::{
    BlobStore, BridgeMessage, CloseCode, CodecConfig, ConnectionId, MessageDecoder, MessageEncoder,
};

use crate::error::{BridgeError, Result};
use crate::relay::{Delivery, Relay};

/// Sending half of a relay link
#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn send(&self, message: BridgeMessage) -> Result<()>;

    async fn close(&self, code: CloseCode);
}

/// An open connection to the relay
pub struct Link {
    pub sender: Arc<dyn LinkSender>,
    pub inbound: mpsc::UnboundedReceiver<Delivery>,
}

/// Opens links to the relay
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

/// Push every fragment of `message` through the codec.
async fn transcode(
    encoder: &MessageEncoder,
    decoder: &mut MessageDecoder,
    message: &BridgeMessage,
) -> Result<Option<BridgeMessage>> {
    let mut decoded = None;
    for fragment in encoder.encode(message).await? {
        if let Some(message) = decoder.decode(fragment).await? {
            decoded = Some(message);
        }
    }
    Ok(decoded)
}

/// Connects to a [`Relay`] in the same process.
///
/// Messages still go through the fragment codec in both directions, so
/// offload and reassembly behave as they do over the network.
pub struct MemoryConnector {
    relay: Arc<Relay>,
    codec: CodecConfig,
    store: Option<Arc<dyn BlobStore>>,
}

impl MemoryConnector {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            codec: CodecConfig::default(),
            store: None,
        }
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn peer_encoder(&self) -> MessageEncoder {
        let encoder = MessageEncoder::new(self.codec.clone());
        match &self.store {
            Some(store) => encoder.with_store(store.clone()),
            None => encoder,
        }
    }

    fn peer_decoder(&self) -> MessageDecoder {
        let decoder = MessageDecoder::new(&self.codec);
        match &self.store {
            Some(store) => decoder.with_store(store.clone()),
            None => decoder,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link> {
        let (id, mut outbound) = self.relay.attach();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let relay_encoder = MessageEncoder::new(self.codec.clone());
        let mut peer_decoder = self.peer_decoder();
        tokio::spawn(async move {
            while let Some(delivery) = outbound.recv().await {
                match delivery {
                    Delivery::Message(message) => {
                        match transcode(&relay_encoder, &mut peer_decoder, &message).await {
                            Ok(Some(message)) => {
                                if inbound_tx.send(Delivery::Message(message)).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(connection_id = %id, error = %e, "dropping undecodable message"),
                        }
                    }
                    close @ Delivery::Close { .. } => {
                        let _ = inbound_tx.send(close);
                        break;
                    }
                }
            }
            debug!(connection_id = %id, "memory link reader finished");
        });

        let sender = MemoryLinkSender {
            relay: self.relay.clone(),
            id,
            encoder: self.peer_encoder(),
            decoder: Mutex::new(MessageDecoder::new(&self.codec)),
        };
        Ok(Link {
            sender: Arc::new(sender),
            inbound: inbound_rx,
        })
    }
}

struct MemoryLinkSender {
    relay: Arc<Relay>,
    id: ConnectionId,
    encoder: MessageEncoder,
    /// Relay-side decoder; never resolves pointers
    decoder: Mutex<MessageDecoder>,
}

#[async_trait]
impl LinkSender for MemoryLinkSender {
    async fn send(&self, message: BridgeMessage) -> Result<()> {
        let mut decoder = self.decoder.lock().await;
        let Some(message) = transcode(&self.encoder, &mut decoder, &message).await? else {
            return Ok(());
        };
        match self.relay.handle(self.id, message) {
            Err(BridgeError::UnknownConnection(_)) => Err(BridgeError::LinkClosed),
            other => other,
        }
    }

    async fn close(&self, _code: CloseCode) {
        self.relay.detach(self.id);
    }
}

impl Drop for MemoryLinkSender {
    fn drop(&mut self) {
        self.relay.detach(self.id);
    }
}
