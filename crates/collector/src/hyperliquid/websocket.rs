//! Hyperliquid WebSocket client.
//!
//! Connects to wss://api.hyperliquid.xyz/ws.
//! - Subscribe: {"method":"subscribe","subscription":{"type":"candle","coin":"BTC","interval":"1m"}}
//! - Keep-alive: application-level {"method":"ping"}, answered with {"channel":"pong"}
//! - The server drops idle connections after 60s without traffic

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async_with_config, tungstenite};
use tracing::{debug, info};

const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MiB
pub const PING_INTERVAL_SECS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum HyperliquidWsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
}

pub struct HyperliquidWebSocket {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl HyperliquidWebSocket {
    pub async fn connect(url: &str) -> Result<Self, HyperliquidWsError> {
        let config = tungstenite::protocol::WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            ..Default::default()
        };

        info!(url = %url, "Connecting to Hyperliquid WS");
        let (ws, _) = connect_async_with_config(url, Some(config), false).await?;
        info!("Connected to Hyperliquid WS");

        Ok(Self { ws })
    }

    /// Send one subscribe request. Hyperliquid acknowledges asynchronously
    /// with a `subscriptionResponse` message, which the reader ignores.
    pub async fn subscribe(&mut self, subscription: Value) -> Result<(), HyperliquidWsError> {
        let msg = json!({
            "method": "subscribe",
            "subscription": subscription,
        });
        debug!(subscription = %msg["subscription"], "Subscribing");
        self.ws.send(tungstenite::Message::Text(msg.to_string())).await?;
        Ok(())
    }

    /// Next text frame. Protocol pings are answered inline.
    pub async fn recv(&mut self) -> Result<String, HyperliquidWsError> {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .ok_or(HyperliquidWsError::ConnectionClosed)??;

            match msg {
                tungstenite::Message::Text(text) => return Ok(text),
                tungstenite::Message::Ping(data) => {
                    self.ws.send(tungstenite::Message::Pong(data)).await?;
                }
                tungstenite::Message::Close(_) => return Err(HyperliquidWsError::ConnectionClosed),
                _ => continue,
            }
        }
    }

    pub async fn ping(&mut self) -> Result<(), HyperliquidWsError> {
        let msg = json!({ "method": "ping" });
        self.ws.send(tungstenite::Message::Text(msg.to_string())).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), HyperliquidWsError> {
        self.ws.close(None).await?;
        Ok(())
    }
}
