// Raw notification payloads and deep-link derivation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RealtimeError, Result};
use crate::models::{Notification, NotificationKind};
use crate::utils::parse_timestamp;

/// Views a notification can point at when it carries no explicit link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationRoutes {
    pub meetings: String,
    pub tasks: String,
    pub projects: String,
    pub fallback: String,
}

impl Default for NotificationRoutes {
    fn default() -> Self {
        NotificationRoutes {
            meetings: "/meetings".to_string(),
            tasks: "/mes-taches".to_string(),
            projects: "/projects".to_string(),
            fallback: "/mes-taches".to_string(),
        }
    }
}

impl NotificationRoutes {
    pub fn fallback(&self) -> &str {
        non_empty(&self.fallback).unwrap_or("/")
    }

    fn or_fallback<'a>(&'a self, route: &'a str) -> &'a str {
        non_empty(route).unwrap_or_else(|| self.fallback())
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Notification as the hub sends it (or as built for a local enqueue).
/// Accepts camelCase and PascalCase keys.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    #[serde(default, alias = "Id")]
    pub id: Option<i64>,
    #[serde(default, alias = "Message")]
    pub message: Option<String>,
    #[serde(default, alias = "Link")]
    pub link: Option<String>,
    #[serde(default, alias = "IsRead")]
    pub is_read: Option<bool>,
    #[serde(default, alias = "CreatedAt")]
    pub created_at: Option<String>,
    #[serde(default, rename = "type", alias = "Type")]
    pub kind: Option<String>,
    #[serde(default, alias = "TaskId")]
    pub task_id: Option<i64>,
    #[serde(default, alias = "TaskItemId")]
    pub task_item_id: Option<i64>,
    #[serde(default, alias = "TaskTitle")]
    pub task_title: Option<String>,
    #[serde(default, alias = "TaskItemTitle")]
    pub task_item_title: Option<String>,
    #[serde(default, alias = "ProjectId")]
    pub project_id: Option<i64>,
    #[serde(default, alias = "ProjectTitle")]
    pub project_title: Option<String>,
    #[serde(default, alias = "MeetingId")]
    pub meeting_id: Option<i64>,
    #[serde(default, alias = "MeetingTitle")]
    pub meeting_title: Option<String>,
}

impl RawNotification {
    /// A bare text notification
    pub fn text(message: impl Into<String>) -> Self {
        RawNotification {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(message) => Ok(RawNotification::text(message)),
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| RealtimeError::MalformedPayload(e.to_string())),
            other => Err(RealtimeError::MalformedPayload(format!(
                "expected a notification object or text, got {}",
                other
            ))),
        }
    }

    /// Link precedence: explicit link, meeting, task, project, fallback
    pub fn derive_link(&self, routes: &NotificationRoutes) -> String {
        if let Some(link) = self.link.as_deref().and_then(non_empty) {
            return link.to_string();
        }

        let tag = self.kind.as_deref().unwrap_or_default().to_lowercase();
        let route = if tag.contains("meeting") || self.meeting_id.is_some() {
            routes.or_fallback(&routes.meetings)
        } else if tag.contains("task") || self.task_id.is_some() || self.task_item_id.is_some() {
            routes.or_fallback(&routes.tasks)
        } else if tag.contains("project") || self.project_id.is_some() {
            routes.or_fallback(&routes.projects)
        } else {
            routes.fallback()
        };
        route.to_string()
    }

    /// Normalize into a stored notification. The returned flag tells whether
    /// the payload carried its own id; when it did not, the id is left at 0
    /// for the store to assign.
    pub fn into_notification(self, routes: &NotificationRoutes, now: DateTime<Utc>) -> (Notification, bool) {
        let link = self.derive_link(routes);
        let kind = self
            .kind
            .as_deref()
            .map(NotificationKind::from_tag)
            .unwrap_or_default();
        let created_at = self
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        let explicit_id = self.id.is_some_and(|id| id != 0);

        let notification = Notification {
            id: self.id.unwrap_or(0),
            message: self.message.unwrap_or_default(),
            link,
            is_read: self.is_read.unwrap_or(false),
            created_at,
            kind,
            task_id: self.task_item_id.or(self.task_id),
            task_title: self.task_title.or(self.task_item_title),
            project_id: self.project_id,
            project_title: self.project_title,
            meeting_id: self.meeting_id,
            meeting_title: self.meeting_title,
        };
        (notification, explicit_id)
    }
}
