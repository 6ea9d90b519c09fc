// Composition root
// Builds the hubs, the chat service and the notification store around
// injected dependencies and exposes the surface consumed by a UI.

use anyhow::Context;
use log::{info, warn};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};

use crate::chat::{ChatService, Delivery, DeliveryPipeline, HistorySource, HttpApi};
use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::hub::{AccessTokenProvider, ConnectionState, HubConnection, HubTransport, WebSocketTransport};
use crate::models::{ChatNotification, ConversationSummary, Message, Notification, UserId, UserProfile};
use crate::notifications::{FileStorage, LoadReport, NotificationStore, RawNotification, StorageAdapter};
use crate::unread::{UnreadAccounting, UnreadSnapshot};
use crate::utils::{Clock, SystemClock};

pub const RECEIVE_NOTIFICATION: &str = "ReceiveNotification";

/// Everything the client talks to outside its own memory
#[derive(Clone)]
pub struct ClientDeps {
    pub transport: Arc<dyn HubTransport>,
    pub history: Arc<dyn HistorySource>,
    pub storage: Arc<dyn StorageAdapter>,
    pub clock: Arc<dyn Clock>,
}

impl ClientDeps {
    /// WebSocket hubs, HTTP history, file storage and the wall clock
    pub fn from_config(
        config: &RealtimeConfig,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> anyhow::Result<Self> {
        let history = HttpApi::new(&config.server_url, &config.history_path, &config.profile_path)
            .context("cannot create HTTP client")?
            .with_tokens(tokens);
        let storage_dir = config.storage_dir()?;
        let storage = FileStorage::new(&storage_dir)
            .with_context(|| format!("cannot use storage directory {}", storage_dir.display()))?;
        Ok(ClientDeps {
            transport: Arc::new(WebSocketTransport),
            history: Arc::new(history),
            storage: Arc::new(storage),
            clock: Arc::new(SystemClock),
        })
    }
}

pub struct RealtimeClient {
    local_user: UserId,
    chat_hub: Arc<HubConnection>,
    notification_hub: Arc<HubConnection>,
    chat: Arc<ChatService>,
    notifications: Arc<NotificationStore>,
    unread: Arc<UnreadAccounting>,
}

impl RealtimeClient {
    pub fn new(config: &RealtimeConfig, local_user: UserId, deps: ClientDeps) -> Self {
        let unread = Arc::new(UnreadAccounting::new());

        let chat_hub = Arc::new(
            HubConnection::new("chat", &config.chat_hub_url(), deps.transport.clone())
                .with_reconnect_policy(config.reconnect_policy())
                .with_keep_alive(config.keep_alive())
                .with_server_timeout(config.server_timeout()),
        );
        let notification_hub = Arc::new(
            HubConnection::new(
                "notifications",
                &config.notification_hub_url(),
                deps.transport.clone(),
            )
            .with_reconnect_policy(config.reconnect_policy())
            .with_keep_alive(config.keep_alive())
            .with_server_timeout(config.server_timeout()),
        );

        let notifications = Arc::new(
            NotificationStore::new(deps.storage.clone(), deps.clock.clone(), unread.clone())
                .with_routes(config.routes.clone())
                .with_retention(config.retention()),
        );

        let pipeline = DeliveryPipeline::new(local_user, config.dedup_tolerance(), unread.clone());
        let chat = Arc::new(
            ChatService::new(
                chat_hub.clone(),
                deps.history.clone(),
                notifications.clone(),
                pipeline,
                deps.clock.clone(),
            )
            .with_read_receipts(config.propagate_read_receipts),
        );

        RealtimeClient {
            local_user,
            chat_hub,
            notification_hub,
            chat,
            notifications,
            unread,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Load saved notifications, register handlers and connect both hubs.
    /// Connection problems are logged and visible through the state watchers.
    pub async fn start(&self, tokens: Arc<dyn AccessTokenProvider>) -> LoadReport {
        let report = self.notifications.load_saved();

        self.chat.register_handlers();
        let store: Weak<NotificationStore> = Arc::downgrade(&self.notifications);
        self.notification_hub
            .on(RECEIVE_NOTIFICATION, move |arguments: Vec<Value>| {
                let Some(store) = store.upgrade() else {
                    return;
                };
                // One notification per invocation; extra arguments are ignored
                let Some(payload) = arguments.into_iter().next() else {
                    warn!("{} arrived without a payload", RECEIVE_NOTIFICATION);
                    return;
                };
                if let Err(e) = store.receive(payload) {
                    warn!("Dropped inbound notification: {}", e);
                }
            });

        tokio::join!(
            self.chat_hub.connect(tokens.clone()),
            self.notification_hub.connect(tokens)
        );
        info!(
            "Client for user {} started (chat: {:?}, notifications: {:?})",
            self.local_user,
            self.chat_hub.current_state(),
            self.notification_hub.current_state()
        );
        report
    }

    pub async fn shutdown(&self) {
        tokio::join!(self.chat_hub.disconnect(), self.notification_hub.disconnect());
        info!("Client for user {} stopped", self.local_user);
    }

    pub fn chat_state(&self) -> watch::Receiver<ConnectionState> {
        self.chat_hub.state()
    }

    pub fn notification_state(&self) -> watch::Receiver<ConnectionState> {
        self.notification_hub.state()
    }

    pub fn unread(&self) -> watch::Receiver<UnreadSnapshot> {
        self.unread.subscribe()
    }

    pub fn unread_snapshot(&self) -> UnreadSnapshot {
        self.unread.snapshot()
    }

    /// New messages in the active conversation
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.chat.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn watch_notifications(&self) -> watch::Receiver<Vec<Notification>> {
        self.notifications.watch_notifications()
    }

    pub fn watch_chat_notifications(&self) -> watch::Receiver<Vec<ChatNotification>> {
        self.notifications.watch_chat_notifications()
    }

    pub async fn open_conversation(&self, other: UserId) -> Result<Vec<Message>> {
        self.chat.open_conversation(other).await
    }

    pub fn close_conversation(&self) {
        self.chat.close_conversation();
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        self.chat.active_conversation()
    }

    pub async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<Delivery> {
        self.chat.send_message(receiver_id, content).await
    }

    pub fn mark_conversation_read(&self, other: UserId) -> usize {
        self.chat.mark_conversation_read(other)
    }

    pub fn messages(&self, other: UserId) -> Vec<Message> {
        self.chat.messages(other)
    }

    pub fn conversation_summary(&self, other: UserId) -> ConversationSummary {
        self.chat.conversation_summary(other)
    }

    pub async fn fetch_profile(&self, user_id: UserId) -> Result<UserProfile> {
        self.chat.fetch_profile(user_id).await
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.notifications()
    }

    pub fn chat_notifications(&self) -> Vec<ChatNotification> {
        self.notifications.chat_notifications()
    }

    pub fn enqueue_notification(&self, raw: RawNotification) -> Option<Notification> {
        self.notifications.enqueue(raw)
    }

    pub fn mark_notification_read(&self, id: i64) -> bool {
        self.notifications.mark_read(id)
    }

    pub fn mark_chat_notification_read(&self, id: i64) -> bool {
        self.notifications.mark_chat_read(id)
    }

    pub fn mark_all_read(&self) -> usize {
        self.notifications.mark_all_read()
    }

    pub fn clear_notifications(&self) {
        self.notifications.clear_notifications();
    }

    pub fn clear_chat_notifications(&self) {
        self.notifications.clear_chat_notifications();
    }

    pub fn clear_all(&self) {
        self.notifications.clear_all();
    }
}
