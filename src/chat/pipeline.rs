// Message delivery pipeline
// receive -> normalize ownership -> dedup -> cache -> forward -> recount

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::chat::cache::ConversationCache;
use crate::error::{RealtimeError, Result};
use crate::models::{ConversationKey, ConversationSummary, Message, RawMessagePayload, UserId};
use crate::unread::UnreadAccounting;

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a single delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Already cached; nothing changed and nobody was notified
    Duplicate,
    /// Stored. `forwarded` tells whether it went to the live view.
    Accepted { message: Message, forwarded: bool },
}

impl Delivery {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Delivery::Duplicate)
    }
}

pub struct DeliveryPipeline {
    local_user: UserId,
    cache: ConversationCache,
    /// Counterparty of the conversation currently being viewed
    active: Option<UserId>,
    live_tx: broadcast::Sender<Message>,
    unread: Arc<UnreadAccounting>,
}

impl DeliveryPipeline {
    pub fn new(local_user: UserId, tolerance: Duration, unread: Arc<UnreadAccounting>) -> Self {
        let (live_tx, _rx) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        DeliveryPipeline {
            local_user,
            cache: ConversationCache::new(local_user, tolerance),
            active: None,
            live_tx,
            unread,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    pub fn active(&self) -> Option<UserId> {
        self.active
    }

    pub fn active_key(&self) -> Option<ConversationKey> {
        self.active
            .map(|other| ConversationKey::new(self.local_user, other))
    }

    pub fn set_active(&mut self, other: Option<UserId>) {
        if self.active != other {
            debug!("Active conversation: {:?} -> {:?}", self.active, other);
        }
        self.active = other;
    }

    /// Live feed of messages that belong to the active conversation
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.live_tx.subscribe()
    }

    /// Validate a raw hub or history payload and deliver it
    pub fn deliver_raw(&mut self, payload: RawMessagePayload, now: DateTime<Utc>) -> Result<Delivery> {
        let message = payload.into_message(now)?;
        self.deliver(message)
    }

    pub fn deliver(&mut self, message: Message) -> Result<Delivery> {
        let key = message.key();
        let Some(counterparty) = key.other(self.local_user) else {
            return Err(RealtimeError::MalformedPayload(format!(
                "message {} -> {} does not involve user {}",
                message.sender_id, message.receiver_id, self.local_user
            )));
        };

        let own = message.sender_id == self.local_user;
        let message = if own { message.unread() } else { message };

        if self.cache.contains_duplicate(key, &message) {
            debug!(
                "Dropping duplicate delivery {:?} in conversation {}",
                message.id, key
            );
            return Ok(Delivery::Duplicate);
        }

        let viewing = self.active == Some(counterparty);
        let message = if viewing && !own { message.read() } else { message };

        self.cache.append(key, message.clone());

        if viewing {
            // No receivers is fine: the view may not be listening yet
            let _ = self.live_tx.send(message.clone());
        }

        self.unread.publish_messages(&self.cache);

        Ok(Delivery::Accepted {
            message,
            forwarded: viewing,
        })
    }

    /// Load fetched history for a conversation, keeping anything that raced ahead of it
    pub fn initialize(&mut self, other: UserId, history: Vec<Message>) {
        let key = ConversationKey::new(self.local_user, other);
        let history = history
            .into_iter()
            .filter(|message| {
                let belongs = message.key() == key;
                if !belongs {
                    warn!(
                        "Skipping history message {:?} outside conversation {}",
                        message.id, key
                    );
                }
                belongs
            })
            .collect();
        self.cache.initialize(key, history);
        self.unread.publish_messages(&self.cache);
    }

    /// Mark what `other` sent to the local user as read and recount
    pub fn mark_conversation_read(&mut self, other: UserId) -> usize {
        let key = ConversationKey::new(self.local_user, other);
        let changed = self.cache.mark_read(key, other);
        self.unread.publish_messages(&self.cache);
        changed
    }

    /// Read receipt from the hub: `receiver_id` has read what `sender_id` sent
    pub fn apply_read_receipt(&mut self, sender_id: UserId, receiver_id: UserId) -> usize {
        let changed = self.cache.mark_read_by_receiver(sender_id, receiver_id);
        self.unread.publish_messages(&self.cache);
        changed
    }

    pub fn messages(&self, other: UserId) -> Vec<Message> {
        self.cache
            .messages(ConversationKey::new(self.local_user, other))
            .to_vec()
    }

    pub fn summary(&self, other: UserId) -> ConversationSummary {
        let key = ConversationKey::new(self.local_user, other);
        let last = self.cache.get_last(key);
        ConversationSummary {
            counterpart_id: other,
            last_message: last.map(|message| message.content.clone()),
            last_message_at: last.map(|message| message.sent_at),
            unread_count: self.cache.get_unread_count(key, other),
        }
    }
}
