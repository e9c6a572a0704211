//! WebSocket transport
//!
//! Client side: [`WebSocketTransport`] dials the router URL and bridges the
//! socket onto a [`Link`]. Server side: [`start_websocket_server`] accepts
//! connections and attaches each one to a [`Router`].
//!
//! Every frame is one JSON text message. Binary, ping and pong messages are
//! ignored.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::router::Router;
use crate::transport::frame::{ClientFrame, ServerFrame};
use crate::transport::{Link, Transport};
use crate::utils::error::TransportError;

#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<Link, TransportError> {
        let (ws_stream, _response) = connect_async(self.url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();

        let url = self.url.clone();
        spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize frame for {url}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                    warn!("Failed to send frame to {url}: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("Send loop closed for {url}");
        });

        spawn(async move {
            while let Some(Ok(msg)) = ws_receiver.next().await {
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else { continue };
                match serde_json::from_str::<ServerFrame>(text) {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Invalid server frame: {err}"),
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Accepts WebSocket connections on `listener` and attaches each to `router`.
/// Runs until the listener fails.
pub async fn start_websocket_server(listener: TcpListener, router: Router) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket router listening on ws://{addr}"),
        Err(e) => warn!("WebSocket router listening on an unknown address: {e}"),
    }

    while let Ok((stream, peer)) = listener.accept().await {
        let router = router.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error from {peer}: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            let Link {
                outbound,
                mut inbound,
            } = match router.attach() {
                Ok(link) => link,
                Err(e) => {
                    warn!("Router refused {peer}: {e}");
                    let _ = ws_sender.close().await;
                    return;
                }
            };

            spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    let text = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize frame for {peer}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                        warn!("Failed to send frame to {peer}: {e}");
                        break;
                    }
                }
                let _ = ws_sender.close().await;
                debug!("Send loop closed for {peer}");
            });

            while let Some(Ok(msg)) = ws_receiver.next().await {
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else { continue };
                match serde_json::from_str::<ClientFrame>(text) {
                    Ok(frame) => {
                        if outbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            "Invalid client frame from {peer}: {err} | {}",
                            text.chars().take(100).collect::<String>()
                        );
                    }
                }
            }

            info!("{peer} disconnected");
        });
    }
}
