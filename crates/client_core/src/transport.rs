//! Duplex text-frame transport to the machine's event channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

pub const DEFAULT_FRAME_BUFFER: usize = 64;

/// Channel ends of one open transport.
///
/// Dropping `outbound` asks the transport to close; `inbound` ends (yields
/// `None`) once the peer goes away.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<Result<String, TransportError>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the handshake succeeds or fails.
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

pub struct WebSocketTransport {
    buffer: usize,
}

impl WebSocketTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_BUFFER)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        let (mut writer, mut reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(self.buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.buffer);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(err) = writer.send(Message::Text(text)).await {
                                let _ = inbound_tx.send(Err(TransportError::Send(err.to_string()))).await;
                                break;
                            }
                        }
                        None => {
                            debug!("outbound side dropped; closing websocket");
                            let _ = writer.close().await;
                            break;
                        }
                    },
                    incoming = reader.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(Ok(text)).await.is_err() {
                                let _ = writer.close().await;
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "websocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            let _ = inbound_tx.send(Err(TransportError::Receive(err.to_string()))).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Maps the controller's HTTP base URL onto its event channel endpoint
/// (`http` → `ws`, `https` → `wss`, path `/ws`).
pub fn event_channel_url(server_url: &Url) -> Result<Url, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason: reason.to_string(),
    };
    let scheme = match server_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("scheme must be http, https, ws or wss")),
    };
    if matches!(server_url.scheme(), "ws" | "wss") {
        return Ok(server_url.clone());
    }

    let mut base = server_url.clone();
    base.set_scheme(scheme)
        .map_err(|()| invalid("cannot switch scheme"))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    base.join("ws").map_err(|err| invalid(&err.to_string()))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
