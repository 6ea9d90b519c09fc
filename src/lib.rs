// Real-time conversation and notification delivery core
pub mod chat;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod models;
pub mod notifications;
pub mod subject;
pub mod unread;
pub mod utils;

// Re-export main types for convenience
pub use client::{ClientDeps, RealtimeClient};
pub use error::{RealtimeError, Result};
pub use models::*;
pub use unread::UnreadSnapshot;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_conversation_key_is_unordered() {
        let a = ConversationKey::new(7, 3);
        let b = ConversationKey::new(3, 7);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "3_7");
        assert_eq!(a.participants(), (3, 7));
        assert_eq!(a.other(3), Some(7));
        assert_eq!(a.other(9), None);
        assert!(a.contains(7));
    }

    #[test]
    fn test_message_creation() {
        let sent_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::new(1, 2, "Hello, world!", sent_at)
            .unwrap()
            .with_id(10)
            .with_sender_name("alice");

        assert_eq!(msg.id, Some(10));
        assert_eq!(msg.sender_id, 1);
        assert_eq!(msg.receiver_id, 2);
        assert_eq!(msg.content, "Hello, world!");
        assert_eq!(msg.sender_name.as_deref(), Some("alice"));
        assert!(!msg.is_read());
        assert_eq!(msg.key(), ConversationKey::new(2, 1));
    }

    #[test]
    fn test_message_to_self_is_rejected() {
        let err = Message::new(4, 4, "echo", Utc::now()).unwrap_err();
        assert!(matches!(err, RealtimeError::MalformedPayload(_)));
    }

    #[test]
    fn test_read_state_is_one_way() {
        let mut msg = Message::new(2, 1, "hi", Utc::now()).unwrap();
        assert!(msg.mark_read());
        assert!(!msg.mark_read());
        assert!(msg.is_read());
    }

    #[test]
    fn test_same_delivery_rules() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let tolerance = Duration::milliseconds(1000);
        let optimistic = Message::new(1, 2, "ok", base).unwrap();
        let echo = Message::new(1, 2, "ok", base + Duration::milliseconds(600))
            .unwrap()
            .with_id(55);

        assert!(optimistic.is_same_delivery(&echo, tolerance));
        assert!(echo.is_same_delivery(&optimistic, tolerance));

        // Distinct server ids are distinct messages even with equal content
        let again = Message::new(1, 2, "ok", base).unwrap().with_id(56);
        assert!(!echo.is_same_delivery(&again, tolerance));

        let reversed = Message::new(2, 1, "ok", base).unwrap();
        assert!(!optimistic.is_same_delivery(&reversed, tolerance));
    }

    #[test]
    fn test_raw_payload_normalization() {
        let now = Utc::now();
        let msg = RawMessagePayload::from_value(json!({
            "id": 9,
            "senderId": 2,
            "receiverId": 1,
            "content": "hey",
            "sender": {"username": "bob"},
            "sentAt": "2024-05-01T12:00:00.250Z"
        }))
        .unwrap()
        .into_message(now)
        .unwrap();
        assert_eq!(msg.sender_name.as_deref(), Some("bob"));
        assert_eq!(msg.sent_at.timestamp_subsec_millis(), 250);

        let fallback = RawMessagePayload::from_value(json!({
            "SenderId": 2, "ReceiverId": 1, "Content": "x", "SentAt": "not a date"
        }))
        .unwrap()
        .into_message(now)
        .unwrap();
        assert_eq!(fallback.sent_at, now);

        assert!(RawMessagePayload::from_value(json!("text")).is_err());
    }

    #[test]
    fn test_notification_kind_from_tag() {
        assert_eq!(NotificationKind::from_tag("meeting_created"), NotificationKind::Meeting);
        assert_eq!(NotificationKind::from_tag("TaskAssigned"), NotificationKind::Task);
        assert_eq!(NotificationKind::from_tag("project"), NotificationKind::Project);
        assert_eq!(NotificationKind::from_tag("chat"), NotificationKind::Chat);
        assert_eq!(NotificationKind::from_tag("whatever"), NotificationKind::General);
    }

    #[test]
    fn test_notification_serialization_uses_type_key() {
        let notification = Notification {
            id: 1,
            message: "Meeting at 10".to_string(),
            link: "/meetings".to_string(),
            is_read: false,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            kind: NotificationKind::Meeting,
            task_id: None,
            task_title: None,
            project_id: None,
            project_title: None,
            meeting_id: Some(4),
            meeting_title: None,
        };
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["type"], "meeting");
        assert_eq!(value["meetingId"], 4);
        assert!(value.get("taskId").is_none());

        let back: Notification = serde_json::from_value(value).unwrap();
        assert_eq!(back, notification);

        let unknown: Notification = serde_json::from_value(json!({
            "id": 2, "message": "m", "link": "/x", "createdAt": "2024-05-01T08:00:00Z", "type": "reminder"
        }))
        .unwrap();
        assert_eq!(unknown.kind, NotificationKind::General);
    }
}
