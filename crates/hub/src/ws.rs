//! axum WebSocket route feeding client frames into a `Session`.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tickhub_store::HistorySource;

use crate::error::HubError;
use crate::hub::{BroadcastHub, ClientSink};
use crate::session::Session;

/// A client that cannot take a frame within this window counts as dead
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const CAPACITY_CLOSE_REASON: &str = "server at capacity";

#[derive(Clone)]
pub struct WsState {
    pub hub: BroadcastHub,
    pub history: Arc<dyn HistorySource>,
    pub max_history: u32,
}

struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
    closed: CancellationToken,
}

impl WsSink {
    async fn close(&self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = self.tx.lock().await.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame not delivered");
        }
    }
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send_text(&self, text: Arc<str>) -> Result<(), HubError> {
        let mut tx = self.tx.lock().await;
        match tokio::time::timeout(SEND_TIMEOUT, tx.send(Message::Text(text.to_string()))).await {
            Ok(result) => result.map_err(|e| HubError::SendFailed(e.to_string())),
            Err(_) => Err(HubError::SendTimeout),
        }
    }

    fn on_disconnect(&self) {
        self.closed.cancel();
    }
}

pub fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (tx, mut rx) = socket.split();
    let closed = CancellationToken::new();
    let sink = Arc::new(WsSink {
        tx: Mutex::new(tx),
        closed: closed.clone(),
    });

    let id = state.hub.next_connection_id();
    if !state.hub.connect(id, sink.clone()) {
        sink.close(close_code::POLICY, CAPACITY_CLOSE_REASON).await;
        return;
    }

    let session = Session::new(id, state.hub.clone(), state.history, state.max_history);
    loop {
        tokio::select! {
            // hub dropped us: failed write or heartbeat
            _ = closed.cancelled() => break,
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "WebSocket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    state.hub.disconnect(id);
}
