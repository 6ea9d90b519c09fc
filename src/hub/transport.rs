// Hub transports
// A transport only moves text frames; handshake and framing live in the connection.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::error::{RealtimeError, Result};

const FRAME_CHANNEL_CAPACITY: usize = 100;

/// Both directions of an open transport. Dropping `outbound` closes the
/// transport; `inbound` yields `None` once the remote side is gone.
#[derive(Debug)]
pub struct HubLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl HubLink {
    /// Build a link plus the far ends of its channels. The far ends are what
    /// a transport (or a test server) drives.
    pub fn pair() -> (HubLink, mpsc::Receiver<String>, mpsc::Sender<String>) {
        let (out_tx, out_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        (
            HubLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Open a transport to `hub_url` authenticated with `access_token`
    async fn open(&self, hub_url: &str, access_token: &str) -> Result<HubLink>;
}

/// WebSocket URL for a hub: http(s) becomes ws(s) and the token travels as
/// the `access_token` query parameter.
pub fn socket_url(hub_url: &str, access_token: &str) -> Result<Url> {
    let mut url = Url::parse(hub_url)
        .map_err(|e| RealtimeError::Config(format!("invalid hub URL '{}': {}", hub_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::Config(format!(
                "unsupported hub URL scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::Config(format!("cannot use scheme {} for {}", scheme, hub_url)))?;
    if !access_token.is_empty() {
        url.query_pairs_mut().append_pair("access_token", access_token);
    }
    Ok(url)
}

/// Direct WebSocket transport (no negotiate round-trip)
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl HubTransport for WebSocketTransport {
    async fn open(&self, hub_url: &str, access_token: &str) -> Result<HubLink> {
        let url = socket_url(hub_url, access_token)?;
        debug!("Opening WebSocket to {}", hub_url);
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RealtimeError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (mut write, mut read) = stream.split();
        let (link, mut out_rx, in_tx) = HubLink::pair();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("WebSocket write task ended");
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping non UTF-8 binary frame: {}", e);
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        debug!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
            debug!("WebSocket read task ended");
        });

        Ok(link)
    }
}
