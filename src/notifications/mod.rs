// Notification store
// Two persisted feeds: system notifications (task, meeting, project events)
// and chat notifications (one entry per message received from someone else).

use chrono::Duration;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::error::{RealtimeError, Result};
use crate::models::{ChatNotification, Message, Notification, UserId};
use crate::unread::UnreadAccounting;
use crate::utils::Clock;

pub mod feed;
pub mod links;
pub mod storage;

pub use feed::{Feed, FeedEntry};
pub use links::{NotificationRoutes, RawNotification};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};

pub const NOTIFICATIONS_KEY: &str = "notifications";
pub const CHAT_NOTIFICATIONS_KEY: &str = "chatNotifications";

const NEW_NOTIFICATION_CAPACITY: usize = 64;

/// What `load_saved` found in local storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub notifications: usize,
    pub chat_notifications: usize,
    pub pruned: usize,
    /// A saved blob was unreadable and both feeds were cleared
    pub reset: bool,
}

pub struct NotificationStore {
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    routes: NotificationRoutes,
    retention: Duration,
    notifications: Feed<Notification>,
    chat: Feed<ChatNotification>,
    unread: Arc<UnreadAccounting>,
    new_tx: broadcast::Sender<Notification>,
}

impl NotificationStore {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        unread: Arc<UnreadAccounting>,
    ) -> Self {
        let (new_tx, _rx) = broadcast::channel(NEW_NOTIFICATION_CAPACITY);
        NotificationStore {
            storage,
            clock,
            routes: NotificationRoutes::default(),
            retention: Duration::days(7),
            notifications: Feed::new(NOTIFICATIONS_KEY),
            chat: Feed::new(CHAT_NOTIFICATIONS_KEY),
            unread,
            new_tx,
        }
    }

    pub fn with_routes(mut self, routes: NotificationRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn routes(&self) -> &NotificationRoutes {
        &self.routes
    }

    /// Read both feeds from storage, dropping entries past the retention
    /// window. Meant to run once at startup.
    pub fn load_saved(&self) -> LoadReport {
        let cutoff = self.clock.now() - self.retention;
        let mut report = LoadReport::default();

        // Feeds restore independently; an unreadable key only empties its own feed
        let restored = [
            (NOTIFICATIONS_KEY, self.restore_feed(&self.notifications, cutoff, &mut report)),
            (CHAT_NOTIFICATIONS_KEY, self.restore_feed(&self.chat, cutoff, &mut report)),
        ];

        let corrupt = restored
            .iter()
            .any(|(_, result)| matches!(result, Err(RealtimeError::MalformedPayload(_))));
        if corrupt {
            for (key, result) in &restored {
                if let Err(e) = result {
                    error!("Saved {} unreadable: {}", key, e);
                }
            }
            error!("Clearing saved notifications");
            self.clear_all();
            report.reset = true;
        } else {
            for (key, result) in restored {
                if let Err(e) = result {
                    warn!("Could not load saved {}: {}", key, e);
                }
            }
        }

        report.notifications = self.notifications.len();
        report.chat_notifications = self.chat.len();
        info!(
            "Loaded {} notifications and {} chat notifications ({} expired)",
            report.notifications, report.chat_notifications, report.pruned
        );
        self.publish_counts();
        report
    }

    fn restore_feed<T: FeedEntry>(
        &self,
        feed: &Feed<T>,
        cutoff: chrono::DateTime<chrono::Utc>,
        report: &mut LoadReport,
    ) -> Result<()> {
        report.pruned += feed.restore(self.storage.as_ref(), cutoff)?;
        Ok(())
    }

    /// Handle a `ReceiveNotification` payload (object or bare text)
    pub fn receive(&self, payload: Value) -> Result<Option<Notification>> {
        let raw = RawNotification::from_value(payload)?;
        Ok(self.enqueue(raw))
    }

    /// Add a notification produced locally or already decoded. Returns the
    /// stored entry, or None when it duplicates one already present.
    pub fn enqueue(&self, raw: RawNotification) -> Option<Notification> {
        let now = self.clock.now();
        let (notification, explicit_id) = raw.into_notification(&self.routes, now);
        let stored = self
            .notifications
            .push(notification, explicit_id, now, self.storage.as_ref())?;

        debug!("New notification {} -> {}", stored.id, stored.link);
        let _ = self.new_tx.send(stored.clone());
        self.publish_counts();
        Some(stored)
    }

    /// Chat notification for a message received from another user
    pub fn record_chat_message(&self, message: &Message, already_read: bool) -> Option<ChatNotification> {
        let entry = ChatNotification {
            id: message.id.unwrap_or(0),
            sender_id: message.sender_id,
            sender_name: message
                .sender_name
                .clone()
                .unwrap_or_else(|| format!("User {}", message.sender_id)),
            message: message.content.clone(),
            is_read: already_read,
            created_at: message.sent_at,
        };
        let explicit_id = message.id.is_some();
        let stored = self
            .chat
            .push(entry, explicit_id, self.clock.now(), self.storage.as_ref())?;
        self.publish_counts();
        Some(stored)
    }

    pub fn mark_read(&self, id: i64) -> bool {
        let changed = self
            .notifications
            .mark_read_where(self.storage.as_ref(), |n| n.id == id);
        self.publish_counts();
        changed > 0
    }

    pub fn mark_all_read(&self) -> usize {
        let changed = self.notifications.mark_read_where(self.storage.as_ref(), |_| true);
        self.publish_counts();
        changed
    }

    pub fn mark_chat_read(&self, id: i64) -> bool {
        let changed = self.chat.mark_read_where(self.storage.as_ref(), |n| n.id == id);
        self.publish_counts();
        changed > 0
    }

    /// Applied when the conversation with `sender_id` is read
    pub fn mark_chat_read_from(&self, sender_id: UserId) -> usize {
        let changed = self
            .chat
            .mark_read_where(self.storage.as_ref(), |n| n.sender_id == sender_id);
        self.publish_counts();
        changed
    }

    pub fn clear_notifications(&self) {
        self.notifications.clear(self.storage.as_ref());
        self.publish_counts();
    }

    pub fn clear_chat_notifications(&self) {
        self.chat.clear(self.storage.as_ref());
        self.publish_counts();
    }

    pub fn clear_all(&self) {
        self.notifications.clear(self.storage.as_ref());
        self.chat.clear(self.storage.as_ref());
        self.publish_counts();
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.entries()
    }

    pub fn chat_notifications(&self) -> Vec<ChatNotification> {
        self.chat.entries()
    }

    pub fn unread_count(&self) -> usize {
        self.notifications.unread_count()
    }

    pub fn unread_chat_count(&self) -> usize {
        self.chat.unread_count()
    }

    /// Each notification as it is accepted
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.new_tx.subscribe()
    }

    /// The whole system feed whenever it changes
    pub fn watch_notifications(&self) -> watch::Receiver<Vec<Notification>> {
        self.notifications.subscribe()
    }

    pub fn watch_chat_notifications(&self) -> watch::Receiver<Vec<ChatNotification>> {
        self.chat.subscribe()
    }

    fn publish_counts(&self) {
        self.unread
            .publish_notifications(self.notifications.unread_count(), self.chat.unread_count());
    }
}
