//! WebSocket connector over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use skillrun_core::protocol::Frame;

use crate::connector::{Connector, Link};
use crate::error::ConnectionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_QUEUE: usize = 256;

/// Connects to `ws://` / `wss://` endpoints, sending the token as a bearer header.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, token: &SecretString, send_queue: usize) -> Result<Link, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Handshake(format!("invalid url {}: {e}", self.url)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|_| ConnectionError::Handshake("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        let (out_tx, out_rx) = mpsc::channel(send_queue);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(pump(ws, out_rx, in_tx));

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Moves frames between the socket and the link channels until either side closes.
async fn pump(ws: WsStream, mut outbound: mpsc::Receiver<Frame>, inbound: mpsc::Sender<Frame>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = %frame.event, error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if inbound.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring non-frame message"),
                    },
                    Message::Close(_) => break,
                    // Ping/pong is answered by tungstenite itself.
                    _ => {}
                }
            }
        }
    }
    debug!("websocket pump finished");
}
