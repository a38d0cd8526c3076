//! One client's request handling on top of the hub.

use std::sync::Arc;
use tracing::{debug, error, warn};

use tickhub_schema::{ErrorCode, ServerMessage, TopicId};
use tickhub_store::HistorySource;

use crate::hub::{BroadcastHub, ConnectionId};
use crate::protocol::{parse_request, ClientRequest};

/// Replies for one connection. Every reply goes through `BroadcastHub::send`
/// so a failed write disconnects the client the same way a broadcast does.
pub struct Session {
    id: ConnectionId,
    hub: BroadcastHub,
    history: Arc<dyn HistorySource>,
    max_history: u32,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        hub: BroadcastHub,
        history: Arc<dyn HistorySource>,
        max_history: u32,
    ) -> Self {
        Self {
            id,
            hub,
            history,
            max_history,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    async fn reply(&self, message: ServerMessage) -> bool {
        self.hub.send(self.id, &message).await
    }

    async fn reply_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.reply(ServerMessage::error(code, message)).await;
    }

    pub async fn handle_text(&self, text: &str) {
        let request = match parse_request(text, self.max_history) {
            Ok(request) => request,
            Err(rejection) => {
                debug!(conn = %self.id, code = ?rejection.code, "Request rejected");
                self.reply_error(rejection.code, rejection.message).await;
                return;
            }
        };

        match request {
            ClientRequest::Subscribe { topic_ids, history } => {
                self.subscribe(topic_ids, history).await
            }
            ClientRequest::Unsubscribe { topic_ids } => self.unsubscribe(topic_ids).await,
            ClientRequest::Ping => {
                self.reply(ServerMessage::pong()).await;
            }
        }
    }

    async fn subscribe(&self, topic_ids: Vec<TopicId>, history: u32) {
        let active = match self.history.active_topics_among(&topic_ids).await {
            Ok(active) => active,
            Err(e) => {
                error!(conn = %self.id, error = %e, "Topic validation query failed");
                self.reply_error(ErrorCode::InternalError, "Internal server error").await;
                return;
            }
        };

        let invalid: Vec<String> = topic_ids
            .iter()
            .filter(|id| !active.contains(id))
            .map(ToString::to_string)
            .collect();
        if !invalid.is_empty() {
            self.reply_error(
                ErrorCode::InvalidTopic,
                format!("Invalid or inactive topic ids: [{}]", invalid.join(", ")),
            )
            .await;
            return;
        }

        if !self.hub.subscribe(self.id, &topic_ids) {
            return;
        }
        let acked = self
            .reply(ServerMessage::Success {
                message: format!("Subscribed to {} topic(s)", topic_ids.len()),
                topic_ids: topic_ids.clone(),
            })
            .await;

        if acked && history > 0 {
            self.send_history(&topic_ids, history).await;
        }
    }

    async fn send_history(&self, topic_ids: &[TopicId], limit: u32) {
        match self.history.candle_history(topic_ids, limit).await {
            Ok(series) => {
                for s in series {
                    if !self.reply(ServerMessage::Historical(s)).await {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(conn = %self.id, error = %e, "Candle history query failed");
                self.reply_error(ErrorCode::HistoricalDataError, "Failed to fetch historical candles")
                    .await;
            }
        }

        match self.history.funding_history(topic_ids, limit).await {
            Ok(series) => {
                for s in series {
                    if !self.reply(ServerMessage::HistoricalFunding(s)).await {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(conn = %self.id, error = %e, "Funding history query failed");
                self.reply_error(ErrorCode::HistoricalDataError, "Failed to fetch historical funding rates")
                    .await;
            }
        }

        match self.history.open_interest_history(topic_ids, limit).await {
            Ok(series) => {
                for s in series {
                    if !self.reply(ServerMessage::HistoricalOi(s)).await {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(conn = %self.id, error = %e, "Open interest history query failed");
                self.reply_error(ErrorCode::HistoricalDataError, "Failed to fetch historical open interest")
                    .await;
            }
        }
    }

    async fn unsubscribe(&self, topic_ids: Vec<TopicId>) {
        if !self.hub.unsubscribe(self.id, &topic_ids) {
            return;
        }
        self.reply(ServerMessage::Success {
            message: format!("Unsubscribed from {} topic(s)", topic_ids.len()),
            topic_ids,
        })
        .await;
    }
}
