// Per-conversation message store for the session
// Messages are only ever added; read state only moves forward.

use chrono::Duration;
use log::debug;
use std::collections::{BTreeMap, HashMap};

use crate::models::{ConversationKey, Message, UserId};

#[derive(Debug)]
pub struct ConversationCache {
    local_user: UserId,
    tolerance: Duration,
    conversations: HashMap<ConversationKey, Vec<Message>>,
}

impl ConversationCache {
    /// `tolerance` is the window inside which two identical deliveries are
    /// treated as the same message
    pub fn new(local_user: UserId, tolerance: Duration) -> Self {
        ConversationCache {
            local_user,
            tolerance,
            conversations: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Replace the stored list with fetched history. Messages that were
    /// cached before the history arrived and are not part of it are kept,
    /// after the history, in their original order. Read flags already set
    /// locally survive on the matching history entries.
    pub fn initialize(&mut self, key: ConversationKey, history: Vec<Message>) {
        let previous = self.conversations.remove(&key).unwrap_or_default();
        let mut merged = history;
        let history_len = merged.len();

        for message in previous {
            match merged[..history_len]
                .iter_mut()
                .find(|known| known.is_same_delivery(&message, self.tolerance))
            {
                Some(known) => {
                    if message.is_read() {
                        known.mark_read();
                    }
                }
                None => merged.push(message),
            }
        }

        debug!(
            "Initialized conversation {} with {} history messages ({} total)",
            key,
            history_len,
            merged.len()
        );
        self.conversations.insert(key, merged);
    }

    /// Append in arrival order, creating the entry if needed
    pub fn append(&mut self, key: ConversationKey, message: Message) {
        self.conversations.entry(key).or_default().push(message);
    }

    pub fn contains_duplicate(&self, key: ConversationKey, message: &Message) -> bool {
        self.conversations
            .get(&key)
            .map(|messages| {
                messages
                    .iter()
                    .any(|known| known.is_same_delivery(message, self.tolerance))
            })
            .unwrap_or(false)
    }

    /// Mark everything `counterparty` sent to the local user as read.
    /// Returns how many messages changed.
    pub fn mark_read(&mut self, key: ConversationKey, counterparty: UserId) -> usize {
        let local_user = self.local_user;
        self.mark_sent_by(key, counterparty, |message| message.receiver_id == local_user)
    }

    /// Read receipt: mark what `sender_id` sent to `receiver_id` as read
    pub fn mark_read_by_receiver(&mut self, sender_id: UserId, receiver_id: UserId) -> usize {
        let key = ConversationKey::new(sender_id, receiver_id);
        self.mark_sent_by(key, sender_id, |message| message.receiver_id == receiver_id)
    }

    fn mark_sent_by(
        &mut self,
        key: ConversationKey,
        sender_id: UserId,
        matches: impl Fn(&Message) -> bool,
    ) -> usize {
        match self.conversations.get_mut(&key) {
            Some(messages) => messages
                .iter_mut()
                .filter(|message| message.sender_id == sender_id && matches(message))
                .map(|message| message.mark_read())
                .filter(|changed| *changed)
                .count(),
            None => 0,
        }
    }

    pub fn get_last(&self, key: ConversationKey) -> Option<&Message> {
        self.conversations.get(&key).and_then(|messages| messages.last())
    }

    pub fn messages(&self, key: ConversationKey) -> &[Message] {
        self.conversations
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get_unread_count(&self, key: ConversationKey, counterparty: UserId) -> usize {
        self.messages(key)
            .iter()
            .filter(|message| message.sender_id == counterparty && !message.is_read())
            .count()
    }

    /// Unread messages addressed to the local user, per conversation.
    /// Conversations without unread messages are left out.
    pub fn unread_by_conversation(&self) -> BTreeMap<ConversationKey, usize> {
        self.conversations
            .iter()
            .filter_map(|(key, messages)| {
                let unread = messages
                    .iter()
                    .filter(|message| message.sender_id != self.local_user && !message.is_read())
                    .count();
                (unread > 0).then_some((*key, unread))
            })
            .collect()
    }

    pub fn total_unread(&self) -> usize {
        self.unread_by_conversation().values().sum()
    }

    pub fn conversation_keys(&self) -> impl Iterator<Item = &ConversationKey> {
        self.conversations.keys()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cache() -> ConversationCache {
        ConversationCache::new(1, Duration::milliseconds(1000))
    }

    #[test]
    fn test_pair_key_symmetry() {
        let mut cache = cache();
        cache.append(ConversationKey::new(1, 2), Message::new(2, 1, "hi", at(0)).unwrap());
        cache.append(ConversationKey::new(2, 1), Message::new(1, 2, "hello", at(1)).unwrap());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.messages(ConversationKey::new(2, 1)).len(), 2);
        assert_eq!(cache.get_last(ConversationKey::new(1, 2)).unwrap().content, "hello");
    }

    #[test]
    fn test_mark_read_counts() {
        let key = ConversationKey::new(1, 2);
        let mut cache = cache();
        for i in 0..3 {
            cache.append(key, Message::new(2, 1, format!("m{}", i), at(i)).unwrap());
        }
        cache.append(key, Message::new(1, 2, "mine", at(5)).unwrap());

        assert_eq!(cache.get_unread_count(key, 2), 3);
        assert_eq!(cache.mark_read(key, 2), 3);
        assert_eq!(cache.get_unread_count(key, 2), 0);

        let mine = cache.get_last(key).unwrap();
        assert_eq!(mine.sender_id, 1);
        assert!(!mine.is_read());

        // Second pass changes nothing
        assert_eq!(cache.mark_read(key, 2), 0);
    }

    #[test]
    fn test_initialize_keeps_live_messages() {
        let key = ConversationKey::new(1, 2);
        let mut cache = cache();
        cache.append(key, Message::new(2, 1, "live one", at(10)).unwrap());
        cache.append(key, Message::new(2, 1, "live two", at(11)).unwrap());

        cache.initialize(key, Vec::new());

        let contents: Vec<_> = cache.messages(key).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["live one", "live two"]);
    }

    #[test]
    fn test_initialize_replaces_and_merges_without_duplicates() {
        let key = ConversationKey::new(1, 2);
        let mut cache = cache();
        cache.append(key, Message::new(2, 1, "stale", at(0)).unwrap().with_id(1).read());
        cache.append(key, Message::new(2, 1, "echoed", at(20)).unwrap().with_id(7));

        let history = vec![
            Message::new(2, 1, "stale", at(0)).unwrap().with_id(1),
            Message::new(1, 2, "older", at(5)).unwrap().with_id(4),
        ];
        cache.initialize(key, history);

        let messages = cache.messages(key);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "stale");
        assert!(messages[0].is_read(), "local read flag must survive the refresh");
        assert_eq!(messages[2].content, "echoed");
    }

    #[test]
    fn test_duplicate_detection_window() {
        let key = ConversationKey::new(1, 2);
        let mut cache = cache();
        let base = Message::new(2, 1, "same", at(0)).unwrap();
        cache.append(key, base.clone());

        let mut close = base.clone();
        close.sent_at = at(0) + Duration::milliseconds(900);
        assert!(cache.contains_duplicate(key, &close));

        let mut far = base.clone();
        far.sent_at = at(0) + Duration::milliseconds(1000);
        assert!(!cache.contains_duplicate(key, &far));

        let other_text = Message::new(2, 1, "different", at(0)).unwrap();
        assert!(!cache.contains_duplicate(key, &other_text));
    }

    #[test]
    fn test_read_receipt_marks_outgoing_only() {
        let key = ConversationKey::new(1, 2);
        let mut cache = cache();
        cache.append(key, Message::new(1, 2, "out", at(0)).unwrap());
        cache.append(key, Message::new(2, 1, "in", at(1)).unwrap());

        assert_eq!(cache.mark_read_by_receiver(1, 2), 1);
        assert!(cache.messages(key)[0].is_read());
        assert!(!cache.messages(key)[1].is_read());
        assert_eq!(cache.total_unread(), 1);
    }

    #[test]
    fn test_unread_by_conversation_ignores_own_messages() {
        let mut cache = cache();
        cache.append(ConversationKey::new(1, 2), Message::new(1, 2, "out", at(0)).unwrap());
        cache.append(ConversationKey::new(1, 3), Message::new(3, 1, "in", at(0)).unwrap());
        cache.append(ConversationKey::new(1, 3), Message::new(3, 1, "in again", at(9)).unwrap());

        let unread = cache.unread_by_conversation();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[&ConversationKey::new(1, 3)], 2);
        assert_eq!(cache.total_unread(), 2);
    }
}
