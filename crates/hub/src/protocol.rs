//! Inbound client requests.
//!
//! `{"action": "subscribe", "topic_ids": [1, 2], "history": 100}`
//! `{"action": "unsubscribe", "topic_ids": [1]}`
//! `{"action": "ping"}`

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use tickhub_schema::{ErrorCode, TopicId};

pub const MAX_TOPICS_PER_REQUEST: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        #[serde(alias = "starlisting_ids")]
        topic_ids: Vec<TopicId>,
        #[serde(default)]
        history: u32,
    },
    Unsubscribe {
        #[serde(alias = "starlisting_ids")]
        topic_ids: Vec<TopicId>,
    },
    Ping,
}

/// A request the session answers with an `error` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Decode and validate one text frame.
///
/// Topic ids come back deduplicated in request order.
pub fn parse_request(text: &str, max_history: u32) -> Result<ClientRequest, Rejection> {
    let value: Value =
        serde_json::from_str(text).map_err(|_| Rejection::new(ErrorCode::InvalidJson, "Invalid JSON"))?;

    match value.get("action").and_then(Value::as_str) {
        Some("subscribe" | "unsubscribe" | "ping") => {}
        Some(other) => {
            return Err(Rejection::new(
                ErrorCode::UnknownAction,
                format!("Unknown action: {}", other),
            ))
        }
        None => return Err(Rejection::new(ErrorCode::UnknownAction, "Missing action")),
    }

    let request: ClientRequest = serde_json::from_value(value).map_err(|e| {
        Rejection::new(ErrorCode::ValidationError, format!("Validation error: {}", e))
    })?;

    match request {
        ClientRequest::Subscribe { topic_ids, history } => {
            if history > max_history {
                return Err(Rejection::new(
                    ErrorCode::ValidationError,
                    format!("history must be between 0 and {}", max_history),
                ));
            }
            Ok(ClientRequest::Subscribe {
                topic_ids: validate_topic_ids(topic_ids)?,
                history,
            })
        }
        ClientRequest::Unsubscribe { topic_ids } => Ok(ClientRequest::Unsubscribe {
            topic_ids: validate_topic_ids(topic_ids)?,
        }),
        ClientRequest::Ping => Ok(ClientRequest::Ping),
    }
}

fn validate_topic_ids(ids: Vec<TopicId>) -> Result<Vec<TopicId>, Rejection> {
    if ids.is_empty() || ids.len() > MAX_TOPICS_PER_REQUEST {
        return Err(Rejection::new(
            ErrorCode::ValidationError,
            format!("topic_ids must contain 1 to {} ids", MAX_TOPICS_PER_REQUEST),
        ));
    }
    if let Some(bad) = ids.iter().find(|id| id.0 <= 0) {
        return Err(Rejection::new(
            ErrorCode::ValidationError,
            format!("topic ids must be positive, got {}", bad),
        ));
    }
    let mut seen = HashSet::new();
    Ok(ids.into_iter().filter(|id| seen.insert(*id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str) -> ErrorCode {
        parse_request(text, 1000).unwrap_err().code
    }

    #[test]
    fn test_subscribe_with_history() {
        let req = parse_request(r#"{"action":"subscribe","topic_ids":[5,6,5],"history":100}"#, 1000)
            .unwrap();
        assert_eq!(
            req,
            ClientRequest::Subscribe {
                topic_ids: vec![TopicId(5), TopicId(6)],
                history: 100,
            }
        );
    }

    #[test]
    fn test_history_defaults_to_zero() {
        let req = parse_request(r#"{"action":"subscribe","starlisting_ids":[1]}"#, 1000).unwrap();
        assert!(matches!(req, ClientRequest::Subscribe { history: 0, .. }));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(code("{not json"), ErrorCode::InvalidJson);
        assert_eq!(code(r#"{"action":"dance"}"#), ErrorCode::UnknownAction);
        assert_eq!(code(r#"{"topic_ids":[1]}"#), ErrorCode::UnknownAction);
        assert_eq!(code(r#"{"action":"subscribe"}"#), ErrorCode::ValidationError);
        assert_eq!(code(r#"{"action":"subscribe","topic_ids":[]}"#), ErrorCode::ValidationError);
        assert_eq!(code(r#"{"action":"subscribe","topic_ids":[0]}"#), ErrorCode::ValidationError);
        assert_eq!(
            code(r#"{"action":"subscribe","topic_ids":[1],"history":1001}"#),
            ErrorCode::ValidationError
        );
        assert_eq!(
            code(r#"{"action":"subscribe","topic_ids":[1],"history":-1}"#),
            ErrorCode::ValidationError
        );
    }

    #[test]
    fn test_too_many_topics() {
        let ids: Vec<i32> = (1..=101).collect();
        let text = serde_json::json!({"action": "unsubscribe", "topic_ids": ids}).to_string();
        assert_eq!(code(&text), ErrorCode::ValidationError);
    }

    #[test]
    fn test_ping() {
        assert_eq!(parse_request(r#"{"action":"ping"}"#, 1000).unwrap(), ClientRequest::Ping);
    }
}
