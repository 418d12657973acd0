// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC transport for the relay: the server side and the peer connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

use tether_protocol::server::application_close_code;
use tether_protocol::{
    BlobStore, BridgeMessage, ClientError, CloseCode, CodecConfig, CodecError, ConnectionHandler,
    FrameError, FramedStream, MessageDecoder, MessageEncoder, TetherClient, TetherClientConfig,
    TetherServer,
};

use crate::error::{BridgeError, Result};
use crate::link::{Connector, Link, LinkSender};
use crate::relay::{Delivery, Relay};

/// How long a closing side waits for its last frames to be acknowledged
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Serves a [`Relay`] over QUIC
pub struct RelayServer {
    server: TetherServer,
    relay: Arc<Relay>,
    codec: CodecConfig,
}

impl RelayServer {
    pub fn new(server: TetherServer, relay: Arc<Relay>, codec: CodecConfig) -> Self {
        Self {
            server,
            relay,
            codec,
        }
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.server.local_addr()?)
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Accept connections until the server is closed.
    pub async fn run(&self) -> Result<()> {
        let relay = self.relay.clone();
        let codec = self.codec.clone();
        self.server
            .run(move |conn: ConnectionHandler| {
                let relay = relay.clone();
                let codec = codec.clone();
                async move {
                    handle_connection(conn, relay, codec).await;
                }
            })
            .await?;
        Ok(())
    }

    /// Close every peer connection and stop accepting new ones.
    pub fn close(&self) {
        self.relay.close_all();
        self.server.close();
    }
}

/// Drive one peer connection until it closes
#[instrument(skip_all, fields(remote = %conn.remote_address()))]
pub async fn handle_connection(conn: ConnectionHandler, relay: Arc<Relay>, codec: CodecConfig) {
    let (mut send, mut recv) = match conn.accept_framed().await {
        Ok(streams) => streams,
        Err(e) => {
            debug!(error = %e, "connection closed before opening a stream");
            return;
        }
    };

    let (id, mut outbound) = relay.attach();
    info!(connection_id = %id, "peer connected");

    let encoder = MessageEncoder::new(codec.clone());
    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(delivery) = outbound.recv().await {
            match delivery {
                Delivery::Message(message) => {
                    let fragments = match encoder.encode(&message).await {
                        Ok(fragments) => fragments,
                        Err(e) => {
                            warn!(connection_id = %id, error = %e, "failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = send.write_all(&fragments).await {
                        debug!(connection_id = %id, error = %e, "write failed");
                        break;
                    }
                }
                Delivery::Close { code, reason } => {
                    // Closing the connection abandons unsent stream data
                    let mut stream = send.into_inner();
                    if stream.finish().is_ok()
                        && tokio::time::timeout(CLOSE_GRACE, stream.stopped())
                            .await
                            .is_err()
                    {
                        debug!(connection_id = %id, "peer did not acknowledge final frames");
                    }
                    writer_conn.close(code, reason.as_bytes());
                    break;
                }
            }
        }
    });

    let mut decoder = MessageDecoder::new(&codec);
    loop {
        let fragment = match decoder.next_fragment(&mut recv).await {
            Ok(fragment) => fragment,
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                debug!(connection_id = %id, error = %e, "read failed");
                break;
            }
        };
        match decoder.decode(fragment).await {
            Ok(Some(message)) => match relay.handle(id, message) {
                Ok(()) => {}
                Err(BridgeError::UnknownConnection(_)) => break,
                Err(e) => warn!(connection_id = %id, error = %e, "rejected message"),
            },
            Ok(None) => {}
            Err(CodecError::UnrecognizedMessage(action)) => {
                warn!(connection_id = %id, %action, "ignoring unrecognized message");
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "protocol error, closing connection");
                conn.close(CloseCode::ProtocolError, b"protocol error");
                break;
            }
        }
    }

    relay.detach(id);
    let _ = writer.await;
    info!(connection_id = %id, "peer disconnected");
}

/// Opens QUIC links to a remote relay
pub struct QuicConnector {
    client_config: TetherClientConfig,
    codec: CodecConfig,
    store: Option<Arc<dyn BlobStore>>,
}

impl QuicConnector {
    pub fn new(client_config: TetherClientConfig) -> Self {
        Self {
            client_config,
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
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self) -> Result<Link> {
        let client = TetherClient::new(self.client_config.clone())?;
        let connection = client.connection().await?;
        let (send, recv) = connection.open_bi().await.map_err(ClientError::from)?;

        let mut decoder = MessageDecoder::new(&self.codec);
        let mut encoder = MessageEncoder::new(self.codec.clone());
        if let Some(store) = &self.store {
            decoder = decoder.with_store(store.clone());
            encoder = encoder.with_store(store.clone());
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_deliveries(
            connection,
            FramedStream::new(recv),
            decoder,
            inbound_tx,
        ));

        let sender = QuicLinkSender {
            client,
            send: Mutex::new(FramedStream::new(send)),
            encoder,
        };
        Ok(Link {
            sender: Arc::new(sender),
            inbound: inbound_rx,
        })
    }
}

async fn read_deliveries(
    connection: quinn::Connection,
    mut recv: FramedStream<RecvStream>,
    mut decoder: MessageDecoder,
    inbound: mpsc::UnboundedSender<Delivery>,
) {
    loop {
        match decoder.next_fragment(&mut recv).await {
            Ok(fragment) => match decoder.decode(fragment).await {
                Ok(Some(message)) => {
                    if inbound.send(Delivery::Message(message)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dropping undecodable message"),
            },
            Err(e) => {
                // The stream may end just before the close frame arrives
                if connection.close_reason().is_none() {
                    let _ = tokio::time::timeout(CLOSE_GRACE, connection.closed()).await;
                }
                let (code, reason) = match connection.close_reason() {
                    Some(err) => (
                        application_close_code(&err).unwrap_or(CloseCode::ProtocolError),
                        err.to_string(),
                    ),
                    None => (CloseCode::Normal, e.to_string()),
                };
                debug!(code = code.as_u32(), %reason, "relay link closed");
                let _ = inbound.send(Delivery::Close { code, reason });
                return;
            }
        }
    }
}

struct QuicLinkSender {
    client: TetherClient,
    send: Mutex<FramedStream<SendStream>>,
    encoder: MessageEncoder,
}

#[async_trait]
impl LinkSender for QuicLinkSender {
    async fn send(&self, message: BridgeMessage) -> Result<()> {
        let fragments = self.encoder.encode(&message).await?;
        let mut send = self.send.lock().await;
        send.write_all(&fragments).await.map_err(|e| match e {
            FrameError::ConnectionClosed => BridgeError::LinkClosed,
            other => BridgeError::Frame(other),
        })
    }

    async fn close(&self, code: CloseCode) {
        self.client.close(code).await;
    }
}
