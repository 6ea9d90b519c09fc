// HTTP side of the chat: conversation history and user profiles

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::error::{RealtimeError, Result};
use crate::hub::AccessTokenProvider;
use crate::models::{Message, RawMessagePayload, UserId, UserProfile};

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Ordered history between `user_id` and `other_user_id`
    async fn history(&self, user_id: UserId, other_user_id: UserId) -> Result<Vec<Message>>;

    /// Display profile for a user; not needed for correctness
    async fn profile(&self, user_id: UserId) -> Result<UserProfile>;
}

/// Turn a history response body into messages. Rows that fail validation are
/// skipped so one bad row does not hide the whole conversation.
pub fn parse_history(body: Value, now: DateTime<Utc>) -> Result<Vec<Message>> {
    let rows = match body {
        Value::Array(rows) => rows,
        other => {
            return Err(RealtimeError::HistoryFetch(format!(
                "expected a list of messages, got {}",
                other
            )))
        }
    };

    let total = rows.len();
    let messages: Vec<Message> = rows
        .into_iter()
        .filter_map(|row| {
            match RawMessagePayload::from_value(row).and_then(|raw| raw.into_message(now)) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping history row: {}", e);
                    None
                }
            }
        })
        .collect();
    debug!("Parsed {} of {} history rows", messages.len(), total);
    Ok(messages)
}

/// REST client for the history and users endpoints
pub struct HttpApi {
    client: Client,
    base: Url,
    history_path: String,
    profile_path: String,
    tokens: Option<Arc<dyn AccessTokenProvider>>,
}

impl HttpApi {
    pub fn new(server_url: &str, history_path: &str, profile_path: &str) -> Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| RealtimeError::Config(format!("invalid server URL '{}': {}", server_url, e)))?;
        let client = Client::builder()
            .build()
            .map_err(|e| RealtimeError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(HttpApi {
            client,
            base,
            history_path: history_path.trim_end_matches('/').to_string(),
            profile_path: profile_path.trim_end_matches('/').to_string(),
            tokens: None,
        })
    }

    /// Send the hub token as a bearer token as well
    pub fn with_tokens(mut self, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| RealtimeError::Config(format!("invalid endpoint '{}': {}", path, e)))
    }

    pub fn history_url(&self, user_id: UserId, other_user_id: UserId) -> Result<Url> {
        self.endpoint(&format!("{}/{}/{}", self.history_path, user_id, other_user_id))
    }

    pub fn profile_url(&self, user_id: UserId) -> Result<Url> {
        self.endpoint(&format!("{}/{}", self.profile_path, user_id))
    }

    async fn get_json(&self, url: Url) -> std::result::Result<Value, String> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = self.tokens.as_ref().and_then(|tokens| tokens.access_token()) {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(|e| e.to_string()),
            StatusCode::UNAUTHORIZED => Err(format!("unauthorized for {}", url)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(format!("{} returned {}: {}", url, status, body))
            }
        }
    }
}

#[async_trait]
impl HistorySource for HttpApi {
    async fn history(&self, user_id: UserId, other_user_id: UserId) -> Result<Vec<Message>> {
        let url = self.history_url(user_id, other_user_id)?;
        debug!("Fetching history from {}", url);
        let body = self.get_json(url).await.map_err(RealtimeError::HistoryFetch)?;
        parse_history(body, Utc::now())
    }

    async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
        let url = self.profile_url(user_id)?;
        let body = self
            .get_json(url)
            .await
            .map_err(|e| RealtimeError::Transport(format!("profile fetch failed: {}", e)))?;
        serde_json::from_value(body).map_err(|e| RealtimeError::MalformedPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_urls() {
        let api = HttpApi::new("http://localhost:5279", "/api/ChatMessages/history", "/api/Users/").unwrap();
        assert_eq!(
            api.history_url(3, 8).unwrap().as_str(),
            "http://localhost:5279/api/ChatMessages/history/3/8"
        );
        assert_eq!(api.profile_url(3).unwrap().as_str(), "http://localhost:5279/api/Users/3");
    }

    #[test]
    fn test_parse_history_skips_bad_rows() {
        let body = json!([
            {"id": 1, "senderId": 2, "receiverId": 1, "content": "hi", "sentAt": "2024-05-01T08:00:00Z", "isRead": true},
            {"id": 2, "senderId": 2, "content": "missing receiver"},
            "garbage",
            {"id": 3, "senderId": 1, "receiverId": 2, "content": "hello", "sender": {"username": "alice"}}
        ]);
        let messages = parse_history(body, Utc::now()).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_read());
        assert_eq!(messages[1].sender_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_parse_history_requires_list() {
        let err = parse_history(json!({"error": "nope"}), Utc::now()).unwrap_err();
        assert!(matches!(err, RealtimeError::HistoryFetch(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_error_kinds() {
        // Nothing listens on the discard port
        let api = HttpApi::new("http://127.0.0.1:9", "/api/ChatMessages/history", "/api/Users").unwrap();
        let err = api.profile(3).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Transport(_)), "got {:?}", err);
        let err = api.history(3, 8).await.unwrap_err();
        assert!(matches!(err, RealtimeError::HistoryFetch(_)), "got {:?}", err);
    }
}
