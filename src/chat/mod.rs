// Chat stream service
// Wires the chat hub to the delivery pipeline: inbound ReceiveMessage and
// MessagesRead events, outbound SendMessage and NotifyMessagesRead.

use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;

use crate::error::{RealtimeError, Result};
use crate::hub::HubConnection;
use crate::models::{ConversationSummary, Message, RawMessagePayload, UserId, UserProfile};
use crate::notifications::NotificationStore;
use crate::utils::Clock;

pub mod cache;
pub mod history;
pub mod pipeline;

pub use cache::ConversationCache;
pub use history::{HistorySource, HttpApi};
pub use pipeline::{Delivery, DeliveryPipeline};

pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const MESSAGES_READ: &str = "MessagesRead";
pub const SEND_MESSAGE: &str = "SendMessage";
pub const NOTIFY_MESSAGES_READ: &str = "NotifyMessagesRead";

pub struct ChatService {
    local_user: UserId,
    hub: Arc<HubConnection>,
    history: Arc<dyn HistorySource>,
    notifications: Arc<NotificationStore>,
    pipeline: Mutex<DeliveryPipeline>,
    clock: Arc<dyn Clock>,
    propagate_read_receipts: bool,
}

impl ChatService {
    pub fn new(
        hub: Arc<HubConnection>,
        history: Arc<dyn HistorySource>,
        notifications: Arc<NotificationStore>,
        pipeline: DeliveryPipeline,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ChatService {
            local_user: pipeline.local_user(),
            hub,
            history,
            notifications,
            pipeline: Mutex::new(pipeline),
            clock,
            propagate_read_receipts: true,
        }
    }

    pub fn with_read_receipts(mut self, enabled: bool) -> Self {
        self.propagate_read_receipts = enabled;
        self
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn hub(&self) -> &Arc<HubConnection> {
        &self.hub
    }

    fn pipeline(&self) -> MutexGuard<'_, DeliveryPipeline> {
        match self.pipeline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register the inbound handlers on the chat hub. Handlers hold a weak
    /// reference so the hub does not keep the service alive.
    pub fn register_handlers(self: &Arc<Self>) {
        let weak: Weak<ChatService> = Arc::downgrade(self);
        self.hub.on(RECEIVE_MESSAGE, move |arguments: Vec<Value>| {
            if let Some(chat) = weak.upgrade() {
                chat.on_receive_message(arguments);
            }
        });

        let weak: Weak<ChatService> = Arc::downgrade(self);
        self.hub.on(MESSAGES_READ, move |arguments: Vec<Value>| {
            if let Some(chat) = weak.upgrade() {
                chat.on_messages_read(arguments);
            }
        });
    }

    fn on_receive_message(&self, arguments: Vec<Value>) {
        let Some(payload) = arguments.into_iter().next() else {
            warn!("{} without a payload", RECEIVE_MESSAGE);
            return;
        };
        if let Err(e) = self.handle_incoming(payload) {
            warn!("Dropped inbound message: {}", e);
        }
    }

    fn on_messages_read(&self, arguments: Vec<Value>) {
        let ids: Vec<Option<UserId>> = arguments.iter().map(Value::as_i64).collect();
        match ids.as_slice() {
            [Some(sender_id), Some(receiver_id), ..] => {
                self.apply_read_receipt(*sender_id, *receiver_id);
            }
            _ => warn!("Malformed {} arguments: {:?}", MESSAGES_READ, arguments),
        }
    }

    /// Run one inbound payload through the pipeline. Messages from other
    /// users also land in the chat notification feed.
    pub fn handle_incoming(&self, payload: Value) -> Result<Delivery> {
        let raw = RawMessagePayload::from_value(payload)?;
        let delivery = self.pipeline().deliver_raw(raw, self.clock.now())?;
        self.after_delivery(&delivery);
        Ok(delivery)
    }

    fn after_delivery(&self, delivery: &Delivery) {
        if let Delivery::Accepted { message, forwarded } = delivery {
            if message.sender_id != self.local_user {
                self.notifications.record_chat_message(message, *forwarded);
            }
        }
    }

    /// Select a conversation: fetch its history, load it into the cache,
    /// make it the active one and mark it read. A failed fetch opens the
    /// conversation with whatever is already cached.
    pub async fn open_conversation(&self, other: UserId) -> Result<Vec<Message>> {
        if other == self.local_user {
            return Err(RealtimeError::MalformedPayload(
                "cannot open a conversation with yourself".to_string(),
            ));
        }

        match self.history.history(self.local_user, other).await {
            Ok(history) => {
                debug!("Fetched {} history messages with {}", history.len(), other);
                self.pipeline().initialize(other, history);
            }
            Err(e) => warn!("History for conversation with {} unavailable: {}", other, e),
        }

        self.pipeline().set_active(Some(other));
        self.mark_conversation_read(other);
        info!("Opened conversation with {}", other);
        Ok(self.messages(other))
    }

    pub fn close_conversation(&self) {
        self.pipeline().set_active(None);
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        self.pipeline().active()
    }

    /// Send through the hub. Once the hub acknowledges, the message is stored
    /// locally; whichever of this copy and the server echo comes second is
    /// dropped as a duplicate.
    pub async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<Delivery> {
        if content.trim().is_empty() {
            return Err(RealtimeError::MalformedPayload("empty message".to_string()));
        }
        let message = Message::new(self.local_user, receiver_id, content, self.clock.now())?;

        self.hub
            .invoke(
                SEND_MESSAGE,
                vec![json!(self.local_user), json!(receiver_id), json!(content)],
            )
            .await?;

        let delivery = self.pipeline().deliver(message)?;
        Ok(delivery)
    }

    /// Mark everything `other` sent us as read, locally first. The remote
    /// notification is fire-and-forget.
    pub fn mark_conversation_read(&self, other: UserId) -> usize {
        let changed = self.pipeline().mark_conversation_read(other);
        self.notifications.mark_chat_read_from(other);
        if self.propagate_read_receipts {
            self.notify_messages_read(other);
        }
        changed
    }

    fn notify_messages_read(&self, other: UserId) {
        if !self.hub.is_connected() {
            debug!("Chat hub offline, read receipt for {} not sent", other);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, read receipt for {} not sent", other);
            return;
        };
        let hub = self.hub.clone();
        let arguments = vec![json!(self.local_user), json!(other)];
        runtime.spawn(async move {
            if let Err(e) = hub.invoke(NOTIFY_MESSAGES_READ, arguments).await {
                debug!("Read receipt for {} failed: {}", other, e);
            }
        });
    }

    /// Inbound `MessagesRead`: `receiver_id` has read what `sender_id` sent
    pub fn apply_read_receipt(&self, sender_id: UserId, receiver_id: UserId) -> usize {
        let changed = self.pipeline().apply_read_receipt(sender_id, receiver_id);
        debug!(
            "Read receipt {} -> {}: {} messages marked",
            sender_id, receiver_id, changed
        );
        changed
    }

    pub fn messages(&self, other: UserId) -> Vec<Message> {
        self.pipeline().messages(other)
    }

    pub fn conversation_summary(&self, other: UserId) -> ConversationSummary {
        self.pipeline().summary(other)
    }

    pub fn unread_count(&self, other: UserId) -> usize {
        self.pipeline().summary(other).unread_count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.pipeline().subscribe()
    }

    pub async fn fetch_profile(&self, user_id: UserId) -> Result<UserProfile> {
        self.history.profile(user_id).await
    }
}
