// Hub connection management
// One HubConnection per stream (chat, notifications). Owns the live link,
// reconnects on failure, dispatches inbound events to single-slot handlers
// and correlates outbound invocations with their completions.

use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};

pub mod protocol;
pub mod reconnect;
pub mod transport;

pub use reconnect::ReconnectPolicy;
pub use transport::{HubLink, HubTransport, WebSocketTransport};

use protocol::{handshake_request, parse_handshake_response, split_records, HubMessage};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
/// Stand-in period for a disabled keep-alive or server timeout
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

fn or_far_future(period: Duration) -> Duration {
    if period.is_zero() {
        FAR_FUTURE
    } else {
        period
    }
}

/// Supplies the opaque credential for each (re)connect attempt
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Lifecycle of a hub connection, observable through `HubConnection::state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// One handler per event name; registering again replaces the previous one.
/// Event names are matched case-insensitively.
#[derive(Default)]
struct HandlerRegistry {
    slots: Mutex<HashMap<String, EventHandler>>,
}

impl HandlerRegistry {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, EventHandler>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set(&self, event: &str, handler: EventHandler) -> bool {
        self.slots().insert(event.to_lowercase(), handler).is_some()
    }

    fn remove(&self, event: &str) -> bool {
        self.slots().remove(&event.to_lowercase()).is_some()
    }

    fn get(&self, event: &str) -> Option<EventHandler> {
        self.slots().get(&event.to_lowercase()).cloned()
    }
}

enum Command {
    Invoke {
        target: String,
        arguments: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Shutdown,
}

struct ActiveConnection {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct HubConnection {
    name: String,
    hub_url: String,
    transport: Arc<dyn HubTransport>,
    policy: ReconnectPolicy,
    keep_alive: Duration,
    server_timeout: Duration,
    handlers: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    active: TokioMutex<Option<ActiveConnection>>,
}

impl HubConnection {
    pub fn new(name: &str, hub_url: &str, transport: Arc<dyn HubTransport>) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        HubConnection {
            name: name.to_string(),
            hub_url: hub_url.to_string(),
            transport,
            policy: ReconnectPolicy::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            handlers: Arc::new(HandlerRegistry::default()),
            state: Arc::new(state),
            active: TokioMutex::new(None),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ping interval; zero disables keep-alive pings
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// How long the server may stay silent before the link counts as lost;
    /// zero disables the check
    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    /// Register the handler for `event`, replacing any earlier one.
    /// Returns true when a handler was replaced.
    pub fn on<F>(&self, event: &str, handler: F) -> bool
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        let replaced = self.handlers.set(event, Arc::new(handler));
        if replaced {
            debug!("Replaced {} handler on {} hub", event, self.name);
        }
        replaced
    }

    pub fn off(&self, event: &str) -> bool {
        self.handlers.remove(event)
    }

    /// Start the connection. A no-op while a connection (or its reconnect
    /// loop) is alive. Waits for the first attempt so the state is settled on
    /// return, but never fails: problems are logged and show up in `state()`.
    pub async fn connect(&self, tokens: Arc<dyn AccessTokenProvider>) {
        let ready_rx = {
            let mut active = self.active.lock().await;
            if let Some(connection) = active.as_ref() {
                if !connection.task.is_finished() {
                    debug!("{} hub already connected or connecting", self.name);
                    return;
                }
            }

            if tokens.access_token().is_none() {
                warn!("No access token available, {} hub not started", self.name);
                return;
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
            let (ready_tx, ready_rx) = oneshot::channel();
            let worker = ConnectionWorker {
                name: self.name.clone(),
                hub_url: self.hub_url.clone(),
                transport: self.transport.clone(),
                policy: self.policy.clone(),
                keep_alive: self.keep_alive,
                server_timeout: self.server_timeout,
                handlers: self.handlers.clone(),
                state: self.state.clone(),
                tokens,
            };
            self.state.send_replace(ConnectionState::Connecting);
            let task = tokio::spawn(worker.run(cmd_rx, ready_tx));
            *active = Some(ActiveConnection {
                commands: cmd_tx,
                task,
            });
            ready_rx
        };

        let _ = ready_rx.await;
    }

    /// Send a command to the hub and wait for its completion
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected(self.name.clone()));
        }

        let commands = {
            let active = self.active.lock().await;
            active.as_ref().map(|connection| connection.commands.clone())
        }
        .ok_or_else(|| RealtimeError::NotConnected(self.name.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Invoke {
                target: target.to_string(),
                arguments,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RealtimeError::NotConnected(self.name.clone()))?;

        reply_rx.await.map_err(|_| {
            RealtimeError::Transport(format!("{} hub stopped before {} completed", self.name, target))
        })?
    }

    /// Tear the connection down and cancel pending reconnects. Safe to call
    /// when not connected.
    pub async fn disconnect(&self) {
        let connection = self.active.lock().await.take();
        if let Some(mut connection) = connection {
            let _ = connection.commands.try_send(Command::Shutdown);
            match tokio::time::timeout(DISCONNECT_GRACE, &mut connection.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} hub task ended abnormally: {}", self.name, e),
                Err(_) => {
                    warn!("{} hub task did not stop in time, aborting", self.name);
                    connection.task.abort();
                }
            }
            info!("Disconnected from {} hub", self.name);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

enum SessionEnd {
    Shutdown,
    Lost { reason: String, allow_reconnect: bool },
}

/// Background side of a HubConnection: connect, run the session, reconnect
struct ConnectionWorker {
    name: String,
    hub_url: String,
    transport: Arc<dyn HubTransport>,
    policy: ReconnectPolicy,
    keep_alive: Duration,
    server_timeout: Duration,
    handlers: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl ConnectionWorker {
    async fn run(self, mut commands: mpsc::Receiver<Command>, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut attempt = 0usize;

        loop {
            match self.establish().await {
                Ok((link, leftover)) => {
                    info!("Connected to {} hub at {}", self.name, self.hub_url);
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }

                    match self.run_session(link, leftover, &mut commands).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost { reason, allow_reconnect } => {
                            warn!("Lost connection to {} hub: {}", self.name, reason);
                            if !allow_reconnect {
                                info!("{} hub closed without reconnect permission", self.name);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "{} hub connection attempt {} failed: {}",
                        self.name,
                        attempt + 1,
                        e
                    );
                }
            }

            let Some(delay) = self.policy.next_delay(attempt) else {
                error!(
                    "Giving up on {} hub after {} reconnection attempts",
                    self.name, attempt
                );
                break;
            };
            attempt += 1;
            self.state.send_replace(ConnectionState::Reconnecting);
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }

            info!("Reconnecting to {} hub in {:?}", self.name, delay);
            if !self.wait_before_retry(delay, &mut commands).await {
                break;
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }
        debug!("{} hub connection task ended", self.name);
    }

    /// Open the transport and complete the handshake. Records that arrived
    /// in the same frame as the handshake answer are returned for dispatch.
    async fn establish(&self) -> Result<(HubLink, Vec<String>)> {
        let token = self
            .tokens
            .access_token()
            .ok_or_else(|| RealtimeError::Transport("no access token available".to_string()))?;

        let mut link = self.transport.open(&self.hub_url, &token).await?;
        link.outbound
            .send(handshake_request())
            .await
            .map_err(|_| RealtimeError::Transport("transport closed during handshake".to_string()))?;

        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, link.inbound.recv())
            .await
            .map_err(|_| RealtimeError::Transport("handshake timed out".to_string()))?
            .ok_or_else(|| RealtimeError::Transport("transport closed during handshake".to_string()))?;

        let mut records = split_records(&frame);
        let answer = records
            .next()
            .ok_or_else(|| RealtimeError::Transport("empty handshake response".to_string()))?;
        parse_handshake_response(answer)?;
        let leftover = records.map(str::to_string).collect();
        Ok((link, leftover))
    }

    async fn run_session(
        &self,
        mut link: HubLink,
        leftover: Vec<String>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> SessionEnd {
        let mut pending: HashMap<String, oneshot::Sender<Result<Value>>> = HashMap::new();

        let period = or_far_future(self.keep_alive);
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);

        let mut end = None;
        for record in &leftover {
            if let Some(closed) = self.handle_record(record, &mut pending) {
                end = Some(closed);
                break;
            }
        }
        let end = match end {
            Some(end) => end,
            None => self.pump(&mut link, &mut pending, commands, &mut keep_alive).await,
        };

        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(RealtimeError::Transport(format!(
                "{} hub connection lost",
                self.name
            ))));
        }
        end
    }

    async fn pump(
        &self,
        link: &mut HubLink,
        pending: &mut HashMap<String, oneshot::Sender<Result<Value>>>,
        commands: &mut mpsc::Receiver<Command>,
        keep_alive: &mut tokio::time::Interval,
    ) -> SessionEnd {
        // Any inbound frame, pings included, proves the server is alive
        let silence_limit = or_far_future(self.server_timeout);
        let silence = tokio::time::sleep(silence_limit);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Invoke { target, arguments, reply }) => {
                        let invocation_id = Uuid::new_v4().to_string();
                        let record = match HubMessage::invocation(Some(invocation_id.clone()), &target, arguments).encode() {
                            Ok(record) => record,
                            Err(e) => {
                                let _ = reply.send(Err(e));
                                continue;
                            }
                        };
                        debug!("Invoking {} on {} hub ({})", target, self.name, invocation_id);
                        if link.outbound.send(record).await.is_err() {
                            let _ = reply.send(Err(RealtimeError::Transport(format!(
                                "{} hub transport closed",
                                self.name
                            ))));
                            return SessionEnd::Lost {
                                reason: "transport closed while sending".to_string(),
                                allow_reconnect: true,
                            };
                        }
                        pending.insert(invocation_id, reply);
                    }
                    Some(Command::Shutdown) | None => return SessionEnd::Shutdown,
                },
                frame = link.inbound.recv() => match frame {
                    Some(frame) => {
                        silence.as_mut().reset(Instant::now() + silence_limit);
                        for record in split_records(&frame) {
                            if let Some(closed) = self.handle_record(record, pending) {
                                return closed;
                            }
                        }
                    }
                    None => {
                        return SessionEnd::Lost {
                            reason: "transport closed".to_string(),
                            allow_reconnect: true,
                        }
                    }
                },
                () = &mut silence => {
                    return SessionEnd::Lost {
                        reason: format!("server silent for {:?}", silence_limit),
                        allow_reconnect: true,
                    };
                }
                _ = keep_alive.tick() => {
                    if let Ok(ping) = HubMessage::Ping.encode() {
                        if link.outbound.send(ping).await.is_err() {
                            return SessionEnd::Lost {
                                reason: "keep-alive ping failed".to_string(),
                                allow_reconnect: true,
                            };
                        }
                    }
                }
            }
        }
    }

    fn handle_record(
        &self,
        record: &str,
        pending: &mut HashMap<String, oneshot::Sender<Result<Value>>>,
    ) -> Option<SessionEnd> {
        let message = match HubMessage::decode(record) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring undecodable record on {} hub: {}", self.name, e);
                return None;
            }
        };

        match message {
            HubMessage::Invocation { target, arguments, .. } => match self.handlers.get(&target) {
                Some(handler) => {
                    debug!("Dispatching {} on {} hub", target, self.name);
                    handler(arguments);
                }
                None => debug!("No handler registered for {} on {} hub", target, self.name),
            },
            HubMessage::Completion { invocation_id, result, error } => {
                match pending.remove(&invocation_id) {
                    Some(reply) => {
                        let outcome = match error {
                            Some(error) => Err(RealtimeError::Invocation(error)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = reply.send(outcome);
                    }
                    None => debug!("Completion for unknown invocation {}", invocation_id),
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close { error, allow_reconnect } => {
                return Some(SessionEnd::Lost {
                    reason: error.unwrap_or_else(|| "server closed the connection".to_string()),
                    allow_reconnect,
                });
            }
            HubMessage::Unsupported(kind) => {
                debug!("Ignoring hub message type {} on {} hub", kind, self.name)
            }
        }
        None
    }

    /// Sleep before the next attempt. Invokes issued meanwhile fail with
    /// NotConnected. Returns false when asked to shut down.
    async fn wait_before_retry(&self, delay: Duration, commands: &mut mpsc::Receiver<Command>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(Command::Invoke { reply, .. }) => {
                        let _ = reply.send(Err(RealtimeError::NotConnected(self.name.clone())));
                    }
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }
}
