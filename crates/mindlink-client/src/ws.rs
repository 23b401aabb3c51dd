//! Socket pump — the WebSocket half of the channel to the core service
//!
//! Owns the physical connection: dials, splits, forwards serialized command
//! frames outward and raw text frames inward as [`ClientInput::Line`], and
//! reconnects with a doubling backoff when the socket drops. Connection
//! transitions are reported to the client loop as inputs, so all state
//! reaction happens on the single consumer.

use crate::client::ClientInput;
use crate::connection::Backoff;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives one logical channel to the core service for the lifetime of the
/// client. Consumes the outbound frame queue; feeds the client input queue.
pub struct SocketPump {
    url: String,
    input_tx: mpsc::UnboundedSender<ClientInput>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
}

impl SocketPump {
    pub fn new(
        url: impl Into<String>,
        input_tx: mpsc::UnboundedSender<ClientInput>,
        outbound_rx: mpsc::UnboundedReceiver<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url: url.into(),
            input_tx,
            outbound_rx,
            shutdown,
        }
    }

    /// Run until shutdown. Never returns early on a socket error; every drop
    /// goes through the backoff-and-redial path.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.input_tx.send(ClientInput::Connecting).is_err() {
                break;
            }
            let stream = tokio::select! {
                result = connect_async(&self.url) => result,
                _ = self.shutdown.cancelled() => break,
            };

            match stream {
                Ok((ws, _)) => {
                    info!("connected to core service at {}", self.url);
                    backoff.reset();
                    if self.input_tx.send(ClientInput::ConnectionUp).is_err() {
                        break;
                    }
                    let reason = self.pump(ws).await;
                    if self
                        .input_tx
                        .send(ClientInput::ConnectionDown(reason))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("connect to {} failed: {}", self.url, e);
                    if self
                        .input_tx
                        .send(ClientInput::ConnectionDown(e.to_string()))
                        .is_err()
                    {
                        break;
                    }
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            let delay = backoff.next_delay();
            debug!("reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("socket pump stopped");
    }

    /// Pump one live connection until it drops. Returns the drop reason.
    async fn pump(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> String {
        let (mut ws_tx, mut ws_rx) = ws.split();
        loop {
            tokio::select! {
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = ws_tx.send(WsMsg::Text(text)).await {
                                return format!("send failed: {}", e);
                            }
                        }
                        None => {
                            // Command source is gone; close cleanly.
                            let _ = ws_tx.send(WsMsg::Close(None)).await;
                            return "outbound queue closed".to_string();
                        }
                    }
                }
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(WsMsg::Text(text))) => {
                            if self.input_tx.send(ClientInput::Line(text)).is_err() {
                                return "input queue closed".to_string();
                            }
                        }
                        Some(Ok(WsMsg::Ping(payload))) => {
                            if let Err(e) = ws_tx.send(WsMsg::Pong(payload)).await {
                                return format!("pong failed: {}", e);
                            }
                        }
                        Some(Ok(WsMsg::Close(_))) | None => {
                            return "connection closed".to_string();
                        }
                        Some(Ok(_)) => {
                            // Binary and pong frames are not part of the protocol.
                        }
                        Some(Err(e)) => {
                            return format!("socket error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMsg::Close(None)).await;
                    return "shutdown".to_string();
                }
            }
        }
    }
}
