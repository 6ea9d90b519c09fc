use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RealtimeError, Result};
use crate::utils::parse_timestamp;

pub type UserId = i64;

/// Canonical unordered pair of participants; (A,B) and (B,A) are the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            ConversationKey { low: a, high: b }
        } else {
            ConversationKey { low: b, high: a }
        }
    }

    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`, if `user` belongs to the pair
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.low == user {
            Some(self.high)
        } else if self.high == user {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.low, self.high)
    }
}

/// A directed chat message between two participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id; absent on optimistic local inserts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    is_read: bool,
}

impl Message {
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Result<Self> {
        if sender_id == receiver_id {
            return Err(RealtimeError::MalformedPayload(format!(
                "sender and receiver are both {}",
                sender_id
            )));
        }
        Ok(Message {
            id: None,
            sender_id,
            receiver_id,
            sender_name: None,
            content: content.into(),
            sent_at,
            is_read: false,
        })
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.receiver_id)
    }

    pub fn is_read(&self) -> bool {
        self.is_read
    }

    /// Flip to read. Returns true only on the false -> true transition;
    /// there is no way back.
    pub fn mark_read(&mut self) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        true
    }

    /// Builder form of `mark_read`, used when a message arrives already read
    pub fn read(mut self) -> Self {
        self.is_read = true;
        self
    }

    /// Reset the flag on a message that has not been stored yet. The local
    /// user's own messages only become read through a receipt.
    pub(crate) fn unread(mut self) -> Self {
        self.is_read = false;
        self
    }

    /// Same logical delivery: matching direction and content with timestamps
    /// closer than `tolerance`. Two distinct server ids are never the same
    /// delivery, whatever their content.
    pub fn is_same_delivery(&self, other: &Message, tolerance: Duration) -> bool {
        if let (Some(a), Some(b)) = (self.id, other.id) {
            return a == b;
        }
        if self.sender_id != other.sender_id
            || self.receiver_id != other.receiver_id
            || self.content != other.content
        {
            return false;
        }
        let delta = self.sent_at.signed_duration_since(other.sent_at);
        delta.num_milliseconds().abs() < tolerance.num_milliseconds()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SenderRef {
    #[serde(default, alias = "Username", alias = "userName")]
    pub username: Option<String>,
}

/// Inbound message shape as it comes off the hub or the history endpoint.
/// Everything is optional here; `into_message` does the validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessagePayload {
    #[serde(default, alias = "Id")]
    pub id: Option<i64>,
    #[serde(default, alias = "SenderId")]
    pub sender_id: Option<UserId>,
    #[serde(default, alias = "ReceiverId")]
    pub receiver_id: Option<UserId>,
    #[serde(default, alias = "Content")]
    pub content: Option<String>,
    #[serde(default, alias = "SenderName")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender: Option<SenderRef>,
    #[serde(default, alias = "SentAt")]
    pub sent_at: Option<String>,
    #[serde(default, alias = "IsRead")]
    pub is_read: Option<bool>,
}

impl RawMessagePayload {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(RealtimeError::MalformedPayload(format!(
                "expected a message object, got {}",
                value
            )));
        }
        serde_json::from_value(value).map_err(|e| RealtimeError::MalformedPayload(e.to_string()))
    }

    /// Validate and normalize. `now` stands in for a missing or unparseable sentAt.
    pub fn into_message(self, now: DateTime<Utc>) -> Result<Message> {
        let sender_id = self
            .sender_id
            .ok_or_else(|| RealtimeError::MalformedPayload("missing senderId".to_string()))?;
        let receiver_id = self
            .receiver_id
            .ok_or_else(|| RealtimeError::MalformedPayload("missing receiverId".to_string()))?;
        let content = self
            .content
            .ok_or_else(|| RealtimeError::MalformedPayload("missing content".to_string()))?;

        let sent_at = self
            .sent_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);

        let mut message = Message::new(sender_id, receiver_id, content, sent_at)?;
        message.id = self.id;
        message.sender_name = self
            .sender_name
            .or_else(|| self.sender.and_then(|s| s.username));
        message.is_read = self.is_read.unwrap_or(false);
        Ok(message)
    }
}

/// Type tag of a system notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Task,
    Chat,
    Meeting,
    Project,
    #[default]
    #[serde(other)]
    General,
}

impl NotificationKind {
    /// Classify a free-form server tag such as "meeting_created" or "TaskAssigned"
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.to_lowercase();
        if tag.contains("meeting") {
            NotificationKind::Meeting
        } else if tag.contains("task") {
            NotificationKind::Task
        } else if tag.contains("project") {
            NotificationKind::Project
        } else if tag.contains("chat") || tag.contains("message") {
            NotificationKind::Chat
        } else {
            NotificationKind::General
        }
    }
}

/// A one-way system event (task, meeting, project...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub message: String,
    pub link: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_title: Option<String>,
}

/// Badge entry created for each chat message received from someone else
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatNotification {
    pub id: i64,
    pub sender_id: UserId,
    pub sender_name: String,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Profile of a user as returned by the users endpoint (display only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

/// Row of the conversation list: last message and unread badge per counterparty
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub counterpart_id: UserId,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: usize,
}
