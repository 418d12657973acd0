// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message codec: bridge messages to fragments and back.
//!
//! Messages are serialized to JSON and split into fragments. Invocation
//! bodies that would serialize above the pointer threshold are written to
//! the blob store first, and the message carries only the storage key.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::time::{Instant, interval_at};
use tracing::debug;

use crate::blob::{BlobError, BlobStore};
use crate::frame::{
    DEFAULT_FRAGMENT_PAYLOAD, DEFAULT_WINDOW_TIMEOUT, Fragment, FrameError, FramedStream,
    Reassembler, split,
};
use crate::message::{BridgeMessage, Envelope};

/// Serialized size above which invocation bodies go to the blob store (1 MiB)
pub const DEFAULT_POINTER_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("unrecognized message action: {0}")]
    UnrecognizedMessage(String),

    #[error("message has no action field")]
    MissingAction,

    #[error("envelope {0} must carry exactly one of payload and payloadPointer")]
    InvalidEnvelope(String),
}

/// Size bounds for the codec
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Payload bytes per fragment
    pub max_fragment_payload: usize,
    /// Serialized message size that triggers pointer offload
    pub pointer_threshold: usize,
    /// Idle bound for incomplete reassembly windows
    pub window_timeout: Duration,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_fragment_payload: DEFAULT_FRAGMENT_PAYLOAD,
            pointer_threshold: DEFAULT_POINTER_THRESHOLD,
            window_timeout: DEFAULT_WINDOW_TIMEOUT,
        }
    }
}

/// Blob key for an offloaded request or response body
pub fn pointer_key(debug_request_id: &str, direction: &str) -> String {
    format!("payloads/{debug_request_id}-{direction}")
}

/// Encodes messages into fragments, offloading oversized bodies
#[derive(Clone)]
pub struct MessageEncoder {
    config: CodecConfig,
    store: Option<Arc<dyn BlobStore>>,
}

impl MessageEncoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode a message into an ordered list of fragments.
    pub async fn encode(&self, message: &BridgeMessage) -> Result<Vec<Fragment>, CodecError> {
        let mut bytes = message.to_vec()?;
        if bytes.len() > self.config.pointer_threshold
            && let Some(offloaded) = self.offload(message).await?
        {
            bytes = offloaded.to_vec()?;
        }
        Ok(split(
            rand::random(),
            Bytes::from(bytes),
            self.config.max_fragment_payload,
        )?)
    }

    async fn offload(&self, message: &BridgeMessage) -> Result<Option<BridgeMessage>, CodecError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let (direction, envelope) = match message {
            BridgeMessage::InvocationRequest(envelope) => ("request", envelope),
            BridgeMessage::InvocationResponse(envelope) => ("response", envelope),
            _ => return Ok(None),
        };
        let Some(payload) = &envelope.payload else {
            return Ok(None);
        };

        let key = pointer_key(&envelope.debug_request_id, direction);
        let data = serde_json::to_vec(payload)?;
        debug!(
            debug_request_id = %envelope.debug_request_id,
            key = %key,
            size = data.len(),
            "offloading payload to blob store"
        );
        store.put(&key, Bytes::from(data)).await?;

        let mut pointer = Envelope::pointer(envelope.debug_request_id.clone(), key);
        pointer.reply_to = envelope.reply_to;
        Ok(Some(match message {
            BridgeMessage::InvocationRequest(_) => BridgeMessage::InvocationRequest(pointer),
            _ => BridgeMessage::InvocationResponse(pointer),
        }))
    }
}

/// Reassembles fragments into messages.
///
/// With a blob store configured, pointer bodies are fetched and inlined
/// before the message is returned. Without one they are passed through
/// untouched, which is what the relay wants.
pub struct MessageDecoder {
    reassembler: Reassembler,
    store: Option<Arc<dyn BlobStore>>,
}

impl MessageDecoder {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            reassembler: Reassembler::new(config.window_timeout),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Feed one fragment; returns the message once all of its fragments arrived.
    pub async fn decode(&mut self, fragment: Fragment) -> Result<Option<BridgeMessage>, CodecError> {
        let Some(bytes) = self.reassembler.push(fragment)? else {
            return Ok(None);
        };
        let message = BridgeMessage::from_slice(&bytes)?;
        Ok(Some(self.resolve(message).await?))
    }

    /// Replace a pointer body with the stored payload.
    pub async fn resolve(&self, mut message: BridgeMessage) -> Result<BridgeMessage, CodecError> {
        let Some(store) = &self.store else {
            return Ok(message);
        };
        if let Some(envelope) = message.envelope_mut()
            && let Some(key) = envelope.payload_pointer.take()
        {
            let data = store.get(&key).await?;
            envelope.payload = Some(serde_json::from_slice(&data)?);
        }
        Ok(message)
    }

    /// Read the next fragment from `stream`, dropping idle windows while
    /// the peer is silent.
    ///
    /// The pending read survives each sweep, so no bytes are lost.
    pub async fn next_fragment<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut FramedStream<R>,
    ) -> Result<Fragment, FrameError> {
        let period = self.reassembler.idle_timeout();
        let mut sweep = interval_at(Instant::now() + period, period);
        let mut read = std::pin::pin!(stream.read_fragment());
        loop {
            tokio::select! {
                fragment = &mut read => return fragment,
                _ = sweep.tick() => {
                    self.evict_stale();
                }
            }
        }
    }

    /// Drop reassembly windows idle past the window timeout.
    pub fn evict_stale(&mut self) -> usize {
        self.reassembler.evict_stale(Instant::now())
    }

    /// Incomplete reassembly windows currently buffered
    pub fn pending_windows(&self) -> usize {
        self.reassembler.pending()
    }
}
