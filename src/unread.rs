// Unread accounting
// Counters are recomputed from the cache and the notification feeds on every
// mutation and published as one snapshot; nothing is counted incrementally.

use log::debug;
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::chat::cache::ConversationCache;
use crate::models::ConversationKey;
use crate::subject::Subject;

/// Everything a badge needs, published as a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    /// Unread chat messages addressed to the local user
    pub messages: usize,
    /// Same count split by conversation; conversations with nothing unread are absent
    pub per_conversation: BTreeMap<ConversationKey, usize>,
    /// Unread system notifications
    pub notifications: usize,
    /// Unread chat notification entries
    pub chat_notifications: usize,
}

impl UnreadSnapshot {
    /// Messages plus system notifications. Chat notifications mirror messages
    /// and are not counted twice.
    pub fn total(&self) -> usize {
        self.messages + self.notifications
    }

    pub fn for_conversation(&self, key: ConversationKey) -> usize {
        self.per_conversation.get(&key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct UnreadAccounting {
    snapshot: Subject<UnreadSnapshot>,
}

impl UnreadAccounting {
    pub fn new() -> Self {
        UnreadAccounting::default()
    }

    /// Recount the chat side from the cache and publish
    pub fn publish_messages(&self, cache: &ConversationCache) {
        let per_conversation = cache.unread_by_conversation();
        let messages = per_conversation.values().sum();
        self.snapshot.update(|snapshot| {
            snapshot.messages = messages;
            snapshot.per_conversation = per_conversation;
        });
        debug!("Unread messages recomputed: {}", messages);
    }

    /// Publish the notification side, counted by the caller from the feeds
    pub fn publish_notifications(&self, notifications: usize, chat_notifications: usize) {
        self.snapshot.update(|snapshot| {
            snapshot.notifications = notifications;
            snapshot.chat_notifications = chat_notifications;
        });
        debug!(
            "Unread notifications recomputed: {} system, {} chat",
            notifications, chat_notifications
        );
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.snapshot.value()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnreadSnapshot> {
        self.snapshot.subscribe()
    }
}
