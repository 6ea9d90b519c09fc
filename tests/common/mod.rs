// Common test utilities for integration tests
// An in-memory hub server speaking the JSON hub protocol, a manual clock and
// a canned history source.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, LevelFilter};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use hubline::chat::HistorySource;
use hubline::error::{RealtimeError, Result};
use hubline::hub::protocol::{split_records, HubMessage, RECORD_SEPARATOR};
use hubline::hub::{ConnectionState, HubLink, HubTransport};
use hubline::models::{Message, UserId, UserProfile};
use hubline::utils::Clock;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const CHAT_HUB: &str = "/chatHub";
pub const NOTIFICATION_HUB: &str = "/notificationHub";
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct HubSide {
    to_client: Option<tokio::sync::mpsc::Sender<String>>,
    connections: usize,
    tokens: Vec<String>,
    invocations: Vec<(String, Vec<Value>)>,
}

#[derive(Default)]
struct FakeHubState {
    hubs: HashMap<String, HubSide>,
    refuse: bool,
    failing_targets: HashSet<String>,
    echo_messages: bool,
    next_message_id: i64,
}

/// Server side of every hub the client opens, keyed by hub path
#[derive(Clone, Default)]
pub struct FakeHub {
    state: Arc<Mutex<FakeHubState>>,
}

fn hub_path(hub_url: &str) -> String {
    url::Url::parse(hub_url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| hub_url.to_string())
}

impl FakeHub {
    pub fn new() -> Self {
        FakeHub::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeHubState> {
        self.state.lock().unwrap()
    }

    /// Fail every transport open while set
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse = refuse;
    }

    /// Answer invocations of `target` with an error completion
    pub fn fail_target(&self, target: &str) {
        self.state().failing_targets.insert(target.to_string());
    }

    /// Push a ReceiveMessage back to the chat hub for every SendMessage,
    /// before acknowledging it, like a server that echoes to the sender
    pub fn echo_messages(&self, echo: bool) {
        self.state().echo_messages = echo;
    }

    pub fn connections(&self, hub: &str) -> usize {
        self.state().hubs.get(hub).map(|side| side.connections).unwrap_or(0)
    }

    pub fn tokens(&self, hub: &str) -> Vec<String> {
        self.state().hubs.get(hub).map(|side| side.tokens.clone()).unwrap_or_default()
    }

    pub fn invocations(&self, hub: &str, target: &str) -> Vec<Vec<Value>> {
        self.state()
            .hubs
            .get(hub)
            .map(|side| {
                side.invocations
                    .iter()
                    .filter(|(t, _)| t == target)
                    .map(|(_, args)| args.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Server-initiated invocation (an event for the client)
    pub async fn push(&self, hub: &str, target: &str, arguments: Vec<Value>) {
        let sender = self
            .state()
            .hubs
            .get(hub)
            .and_then(|side| side.to_client.clone())
            .expect("hub not connected");
        let frame = HubMessage::invocation(None, target, arguments).encode().unwrap();
        sender.send(frame).await.expect("client gone");
    }

    /// Several records in one transport frame
    pub async fn push_batch(&self, hub: &str, events: Vec<(&str, Vec<Value>)>) {
        let sender = self
            .state()
            .hubs
            .get(hub)
            .and_then(|side| side.to_client.clone())
            .expect("hub not connected");
        let frame: String = events
            .into_iter()
            .map(|(target, arguments)| HubMessage::invocation(None, target, arguments).encode().unwrap())
            .collect();
        sender.send(frame).await.expect("client gone");
    }

    /// Send a Close record to the client
    pub async fn close(&self, hub: &str, allow_reconnect: bool) {
        let sender = self
            .state()
            .hubs
            .get_mut(hub)
            .and_then(|side| side.to_client.take())
            .expect("hub not connected");
        let frame = HubMessage::Close {
            error: Some("server restarting".to_string()),
            allow_reconnect,
        }
        .encode()
        .unwrap();
        let _ = sender.send(frame).await;
    }

    pub async fn wait_for_invocation(&self, hub: &str, target: &str, count: usize) -> Vec<Vec<Value>> {
        let found = timeout(WAIT, async {
            loop {
                let invocations = self.invocations(hub, target);
                if invocations.len() >= count {
                    return invocations;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("{} was not invoked {} times on {}", target, count, hub))
    }

    pub async fn wait_for_connections(&self, hub: &str, count: usize) {
        timeout(WAIT, async {
            while self.connections(hub) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reached {} connections", hub, count));
    }

    /// Handle one client record. Returns the frames to send back.
    fn answer(&self, hub: &str, record: &str) -> Vec<String> {
        let Ok(HubMessage::Invocation { invocation_id, target, arguments }) = HubMessage::decode(record) else {
            return Vec::new();
        };

        let mut state = self.state();
        let failing = state.failing_targets.contains(&target);
        let mut frames = Vec::new();

        if state.echo_messages && target == "SendMessage" && !failing {
            state.next_message_id += 1;
            let echo = json!({
                "id": state.next_message_id,
                "senderId": arguments.first().cloned().unwrap_or(Value::Null),
                "receiverId": arguments.get(1).cloned().unwrap_or(Value::Null),
                "content": arguments.get(2).cloned().unwrap_or(Value::Null),
                "sentAt": Utc::now().to_rfc3339(),
            });
            frames.push(HubMessage::invocation(None, "ReceiveMessage", vec![echo]).encode().unwrap());
        }

        state
            .hubs
            .entry(hub.to_string())
            .or_default()
            .invocations
            .push((target.clone(), arguments));

        if let Some(invocation_id) = invocation_id {
            let completion = HubMessage::Completion {
                invocation_id,
                result: (!failing).then_some(Value::Null),
                error: failing.then(|| format!("{} rejected by server", target)),
            };
            frames.push(completion.encode().unwrap());
        }
        frames
    }
}

#[async_trait]
impl HubTransport for FakeHub {
    async fn open(&self, hub_url: &str, access_token: &str) -> Result<HubLink> {
        let hub = hub_path(hub_url);
        if self.state().refuse {
            return Err(RealtimeError::Transport(format!("{} refused", hub)));
        }

        let (link, mut from_client, to_client) = HubLink::pair();
        {
            let mut state = self.state();
            let side = state.hubs.entry(hub.clone()).or_default();
            side.connections += 1;
            side.tokens.push(access_token.to_string());
            side.to_client = Some(to_client.clone());
        }

        let server = self.clone();
        tokio::spawn(async move {
            let mut handshaken = false;
            while let Some(frame) = from_client.recv().await {
                for record in split_records(&frame) {
                    if !handshaken {
                        handshaken = true;
                        let _ = to_client.send(format!("{{}}{}", RECORD_SEPARATOR)).await;
                        continue;
                    }
                    for reply in server.answer(&hub, record) {
                        if to_client.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            debug!("Fake {} session ended", hub);
        });

        Ok(link)
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// History endpoint stand-in. A gated source holds every request until the
/// gate is released.
#[derive(Default)]
pub struct CannedHistory {
    conversations: Mutex<HashMap<(UserId, UserId), Vec<Message>>>,
    failing: Mutex<bool>,
    gate: Option<Arc<Notify>>,
    requests: Mutex<usize>,
}

impl CannedHistory {
    pub fn new() -> Self {
        CannedHistory::default()
    }

    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            CannedHistory {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }

    pub fn set(&self, a: UserId, b: UserId, messages: Vec<Message>) {
        self.conversations
            .lock()
            .unwrap()
            .insert((a.min(b), a.max(b)), messages);
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[async_trait]
impl HistorySource for CannedHistory {
    async fn history(&self, user_id: UserId, other_user_id: UserId) -> Result<Vec<Message>> {
        *self.requests.lock().unwrap() += 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if *self.failing.lock().unwrap() {
            return Err(RealtimeError::HistoryFetch("503 Service Unavailable".to_string()));
        }
        let key = (user_id.min(other_user_id), user_id.max(other_user_id));
        Ok(self.conversations.lock().unwrap().get(&key).cloned().unwrap_or_default())
    }

    async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
        Ok(UserProfile {
            id: user_id,
            username: format!("user{}", user_id),
            email: None,
            profile_picture: None,
        })
    }
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
    let reached = timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == wanted {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "state never became {:?}", wanted);
    assert_eq!(*rx.borrow(), wanted);
}

/// Poll until `condition` holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let ok = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "timed out waiting for {}", what);
}

pub fn incoming(id: i64, sender: UserId, receiver: UserId, content: &str) -> Value {
    json!({
        "id": id,
        "senderId": sender,
        "receiverId": receiver,
        "content": content,
        "sentAt": Utc::now().to_rfc3339(),
    })
}
