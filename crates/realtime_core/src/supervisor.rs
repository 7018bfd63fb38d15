use std::{
    collections::HashMap,
    future::Future,
    slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use pubsub::{
    user_capabilities, ClientOptions, InboundMessage, PubSubClient, PubSubConnector,
    TokenIssuer, TransportState, TransportStateChange,
};
use shared::{
    domain::{
        channel_kind, conversation_channel, ChannelKind, ConnectionStatus, ConversationId,
        MessageId, UserId,
    },
    error::ApiError,
    protocol::{
        ConnectionState, ConversationMessage, PresenceAction, PresenceData, MESSAGE_EVENT_NAME,
    },
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex, RwLock,
    },
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    channels::{essential_channels, ChannelRegistry, ConnectionKey, JoinedChannel},
    clock::Clock,
    config::RealtimeSettings,
    dedup::DuplicateFilter,
    delivery::DeliveryTracker,
    error::RealtimeError,
    events::{RealtimeEvent, EVENT_CHANNEL_CAPACITY},
    offline_queue::OfflineQueue,
    state_machine::{transition, BackoffPolicy, Effect, Event, MachineState},
};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type StateReceiver = broadcast::Receiver<TransportStateChange>;

/// Runs a transport call, failing it once `limit` has passed.
async fn within<T>(
    limit: Duration,
    operation: &str,
    call: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{operation} timed out after {limit:?}")),
    }
}

/// Outcome of handing one message to the user's event subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Delivered,
    /// Not addressed to the user, or already handed over inside the window.
    Skipped,
    /// Nobody is subscribed; the message must stay queued.
    NoListener,
}

/// Owns every (conversation, user) connection: opens transports, runs the
/// lifecycle state machine, reconnects with backoff, probes health and
/// replays channels and presence after recovery.
pub struct ConnectionSupervisor {
    connector: Arc<dyn PubSubConnector>,
    tokens: Arc<dyn TokenIssuer>,
    settings: RealtimeSettings,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    channels: ChannelRegistry,
    offline_queue: Arc<OfflineQueue>,
    deliveries: Arc<DeliveryTracker>,
    duplicates: DuplicateFilter<(UserId, MessageId)>,
    connections: RwLock<HashMap<ConnectionKey, Arc<ManagedConnection>>>,
    generations: AtomicU64,
    events: broadcast::Sender<RealtimeEvent>,
}

struct ManagedConnection {
    key: ConnectionKey,
    inner: Mutex<ConnectionInner>,
    view: StdMutex<ConnectionView>,
    tasks: StdMutex<ConnectionTasks>,
}

struct ConnectionInner {
    machine: MachineState,
    /// Identifies the current transport client; events carrying an older
    /// generation are stale.
    generation: u64,
    client: Option<Arc<dyn PubSubClient>>,
    connection_id: Option<String>,
    client_id: Option<String>,
    last_connected: Option<DateTime<Utc>>,
    latency: Option<Duration>,
}

#[derive(Clone)]
struct ConnectionView {
    state: ConnectionState,
    client: Option<Arc<dyn PubSubClient>>,
}

#[derive(Default)]
struct ConnectionTasks {
    reconnect: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    inbound: Option<JoinHandle<()>>,
}

impl ConnectionTasks {
    fn abort_all(&mut self) {
        for handle in [
            self.reconnect.take(),
            self.health.take(),
            self.watcher.take(),
            self.inbound.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

impl ManagedConnection {
    fn new(key: ConnectionKey) -> Self {
        let inner = ConnectionInner {
            machine: MachineState::connecting(),
            generation: 0,
            client: None,
            connection_id: None,
            client_id: None,
            last_connected: None,
            latency: None,
        };
        let view = ConnectionView {
            state: snapshot(&key, &inner),
            client: None,
        };
        Self {
            key,
            inner: Mutex::new(inner),
            view: StdMutex::new(view),
            tasks: StdMutex::new(ConnectionTasks::default()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, ConnectionTasks> {
        lock(&self.tasks)
    }

    fn view(&self) -> ConnectionView {
        lock(&self.view).clone()
    }

    fn refresh_view(&self, inner: &ConnectionInner) -> ConnectionState {
        let state = snapshot(&self.key, inner);
        let client = match inner.machine.status {
            ConnectionStatus::Connected => inner.client.clone(),
            _ => None,
        };
        *lock(&self.view) = ConnectionView {
            state: state.clone(),
            client,
        };
        state
    }
}

fn snapshot(key: &ConnectionKey, inner: &ConnectionInner) -> ConnectionState {
    ConnectionState {
        conversation_id: key.conversation_id.clone(),
        user_id: key.user_id.clone(),
        status: inner.machine.status,
        last_connected: inner.last_connected,
        reconnect_attempts: inner.machine.reconnect_attempts,
        latency_ms: inner
            .latency
            .map(|latency| u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
        connection_id: inner.connection_id.clone(),
        client_id: inner.client_id.clone(),
    }
}

fn presence_payload(
    user_id: &UserId,
    action: PresenceAction,
    at: DateTime<Utc>,
    connection_id: Option<String>,
) -> serde_json::Value {
    serde_json::to_value(PresenceData {
        user_id: user_id.clone(),
        action,
        at,
        connection_id,
    })
    .unwrap_or_default()
}

async fn wait_until_connected(
    client: &dyn PubSubClient,
    states: &mut StateReceiver,
) -> Result<(), String> {
    loop {
        match client.state() {
            TransportState::Connected => return Ok(()),
            state @ (TransportState::Failed | TransportState::Closed) => {
                return Err(format!("transport entered {state:?} during handshake"));
            }
            _ => {}
        }
        match states.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err("transport closed its lifecycle stream".into()),
        }
    }
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn PubSubConnector>,
        tokens: Arc<dyn TokenIssuer>,
        settings: RealtimeSettings,
        clock: Arc<dyn Clock>,
        offline_queue: Arc<OfflineQueue>,
        deliveries: Arc<DeliveryTracker>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            tokens,
            policy: settings.backoff_policy(),
            duplicates: DuplicateFilter::new(settings.duplicate_window(), Arc::clone(&clock)),
            settings,
            clock,
            channels: ChannelRegistry::new(),
            offline_queue,
            deliveries,
            connections: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    /// Opens (or reuses) the connection for `user_id` in `conversation_id`.
    /// Already connected is a no-op; a failed connection starts over.
    pub async fn connect(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConnectionState, RealtimeError> {
        let key = ConnectionKey::new(conversation_id.clone(), user_id.clone());
        let connection = {
            let mut connections = self.connections.write().await;
            Arc::clone(
                connections
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(ManagedConnection::new(key.clone()))),
            )
        };

        let mut inner = connection.inner.lock().await;
        if inner.machine.status == ConnectionStatus::Connected {
            return Ok(connection.view().state);
        }

        connection.tasks().abort_all();
        if let Some(stale) = inner.client.take() {
            self.close_client(&key, stale).await;
        }
        inner.machine = transition(&inner.machine, Event::ConnectRequested, &self.policy).state;
        self.publish_state(&connection, &inner);
        info!(%conversation_id, %user_id, "realtime: connecting");

        match self.open_transport(&key).await {
            Ok((client, states)) => {
                self.install_client(&connection, &mut inner, client, states);
                let next = transition(&inner.machine, Event::TransportConnected, &self.policy);
                inner.machine = next.state;
                info!(
                    %conversation_id,
                    %user_id,
                    connection_id = inner.connection_id.as_deref().unwrap_or_default(),
                    "realtime: connected"
                );
                self.execute(&connection, &mut inner, next.effects).await;
                Ok(self.publish_state(&connection, &inner))
            }
            Err(err) => {
                let next = transition(&inner.machine, Event::ConnectFailed, &self.policy);
                inner.machine = next.state;
                self.execute(&connection, &mut inner, next.effects).await;
                warn!(%conversation_id, %user_id, error = %err, "realtime: connect failed");
                self.publish_state(&connection, &inner);
                let _ = self.events.send(RealtimeEvent::Error(ApiError::from(&err)));
                Err(err)
            }
        }
    }

    /// Tears down the user's connection, or every connection of the
    /// conversation when `user_id` is `None`. Returns how many were removed.
    pub async fn disconnect(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        user_id: Option<&UserId>,
    ) -> usize {
        let removed: Vec<Arc<ManagedConnection>> = {
            let mut connections = self.connections.write().await;
            let keys: Vec<ConnectionKey> = connections
                .keys()
                .filter(|key| {
                    key.conversation_id == *conversation_id
                        && user_id.map_or(true, |user_id| key.user_id == *user_id)
                })
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| connections.remove(key))
                .collect()
        };

        for connection in &removed {
            self.teardown(connection).await;
        }
        removed.len()
    }

    pub async fn get_connection_state(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Option<ConnectionState> {
        let key = ConnectionKey::new(conversation_id.clone(), user_id.clone());
        self.lookup(&key).await.map(|connection| connection.view().state)
    }

    pub async fn is_connected(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.connected_client(conversation_id, user_id).await.is_some()
    }

    pub async fn connected_client(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Option<Arc<dyn PubSubClient>> {
        let key = ConnectionKey::new(conversation_id.clone(), user_id.clone());
        self.lookup(&key).await?.view().client
    }

    /// Records `channel` for the connection and attaches it right away when
    /// connected; otherwise it is attached on the next (re)connect.
    pub async fn add_channel(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        channel: &str,
    ) -> Result<JoinedChannel, RealtimeError> {
        let key = ConnectionKey::new(conversation_id.clone(), user_id.clone());
        let not_connected = || RealtimeError::NotConnected {
            conversation_id: conversation_id.clone(),
            user_id: user_id.clone(),
        };
        let connection = self.lookup(&key).await.ok_or_else(not_connected)?;
        let inner = connection.inner.lock().await;

        let newly_joined = self.channels.join(&key, channel, self.clock.now()).await;
        if let (ConnectionStatus::Connected, Some(client)) = (inner.machine.status, &inner.client) {
            let attached = within(self.operation_timeout(), "attach", client.attach(channel)).await;
            if let Err(err) = attached {
                if newly_joined {
                    self.channels.leave(&key, channel).await;
                }
                return Err(RealtimeError::Transport(err));
            }
        }
        debug!(%conversation_id, %user_id, channel, "realtime: channel added");
        self.channels.get(&key, channel).await.ok_or_else(not_connected)
    }

    pub async fn get_channel(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        channel: &str,
    ) -> Option<JoinedChannel> {
        let key = ConnectionKey::new(conversation_id.clone(), user_id.clone());
        self.channels.get(&key, channel).await
    }

    pub async fn list_channels(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Vec<JoinedChannel> {
        let key = ConnectionKey::new(conversation_id.clone(), user_id.clone());
        self.channels.list_channels(&key).await
    }

    fn operation_timeout(&self) -> Duration {
        self.settings.connection_timeout()
    }

    async fn lookup(&self, key: &ConnectionKey) -> Option<Arc<ManagedConnection>> {
        self.connections.read().await.get(key).cloned()
    }

    async fn is_registered(&self, connection: &Arc<ManagedConnection>) -> bool {
        self.connections
            .read()
            .await
            .get(&connection.key)
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }

    fn publish_state(&self, connection: &ManagedConnection, inner: &ConnectionInner) -> ConnectionState {
        let state = connection.refresh_view(inner);
        let _ = self
            .events
            .send(RealtimeEvent::ConnectionStateChanged(state.clone()));
        state
    }

    async fn open_transport(
        &self,
        key: &ConnectionKey,
    ) -> Result<(Arc<dyn PubSubClient>, StateReceiver), RealtimeError> {
        let timeout = self.settings.connection_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || RealtimeError::ConnectionTimeout {
            conversation_id: key.conversation_id.clone(),
            user_id: key.user_id.clone(),
            timeout,
        };

        let capabilities = user_capabilities(&key.user_id);
        let token = tokio::time::timeout_at(deadline, self.tokens.issue(&key.user_id, &capabilities))
            .await
            .map_err(|_| timed_out())?
            .map_err(|source| RealtimeError::Token {
                user_id: key.user_id.clone(),
                source,
            })?;

        let options = ClientOptions {
            client_id: key.user_id.to_string(),
            token: token.token,
        };
        let client = tokio::time::timeout_at(deadline, self.connector.open(options))
            .await
            .map_err(|_| timed_out())?
            .map_err(|err| RealtimeError::ConnectionRejected {
                user_id: key.user_id.clone(),
                reason: format!("{err:#}"),
            })?;

        let mut states = client.subscribe_state();
        let outcome =
            tokio::time::timeout_at(deadline, wait_until_connected(client.as_ref(), &mut states))
                .await;
        match outcome {
            Ok(Ok(())) => Ok((client, states)),
            Ok(Err(reason)) => {
                self.close_client(key, client).await;
                Err(RealtimeError::ConnectionRejected {
                    user_id: key.user_id.clone(),
                    reason,
                })
            }
            Err(_) => {
                self.close_client(key, client).await;
                Err(timed_out())
            }
        }
    }

    async fn close_client(&self, key: &ConnectionKey, client: Arc<dyn PubSubClient>) {
        match tokio::time::timeout(self.settings.cleanup_timeout(), client.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, error = %err, "realtime: closing transport failed");
            }
            Err(_) => {
                warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, "realtime: closing transport timed out");
            }
        }
    }

    fn install_client(
        self: &Arc<Self>,
        connection: &Arc<ManagedConnection>,
        inner: &mut ConnectionInner,
        client: Arc<dyn PubSubClient>,
        states: StateReceiver,
    ) {
        inner.generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        inner.connection_id = client.connection_id();
        inner.client_id = Some(client.client_id().to_string());
        inner.last_connected = Some(self.clock.now());
        inner.latency = None;

        let watcher = self.spawn_watcher(connection, Arc::clone(&client), states, inner.generation);
        let inbound = self.spawn_inbound(connection.key.clone(), client.subscribe_messages());
        inner.client = Some(client);

        let mut tasks = connection.tasks();
        if let Some(previous) = tasks.watcher.replace(watcher) {
            previous.abort();
        }
        if let Some(previous) = tasks.inbound.replace(inbound) {
            previous.abort();
        }
    }

    async fn execute(
        self: &Arc<Self>,
        connection: &Arc<ManagedConnection>,
        inner: &mut ConnectionInner,
        effects: Vec<Effect>,
    ) {
        let key = &connection.key;
        for effect in effects {
            match effect {
                Effect::StartHealthMonitor => {
                    if let Some(client) = inner.client.clone() {
                        let handle = self.spawn_health_monitor(connection, client, inner.generation);
                        let previous = connection.tasks().health.replace(handle);
                        if let Some(previous) = previous {
                            previous.abort();
                        }
                    }
                }
                Effect::StopHealthMonitor => {
                    let previous = connection.tasks().health.take();
                    if let Some(previous) = previous {
                        previous.abort();
                    }
                }
                Effect::JoinChannels => {
                    if let Some(client) = inner.client.clone() {
                        self.join_channels(key, &client, inner.connection_id.clone())
                            .await;
                    }
                }
                Effect::ReplayChannels => {
                    if let Some(client) = inner.client.clone() {
                        self.replay_channels(key, &client, inner.connection_id.clone())
                            .await;
                    }
                }
                Effect::DrainOfflineQueue => self.deliver_offline(key).await,
                Effect::ScheduleReconnect { attempt, delay } => {
                    info!(
                        conversation_id = %key.conversation_id,
                        user_id = %key.user_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "realtime: reconnect scheduled"
                    );
                    let _ = self.events.send(RealtimeEvent::ReconnectScheduled {
                        conversation_id: key.conversation_id.clone(),
                        user_id: key.user_id.clone(),
                        attempt,
                        delay,
                    });
                    let handle = tokio::spawn(Arc::clone(self).attempt_reconnect(
                        Arc::clone(connection),
                        inner.generation,
                        delay,
                    ));
                    let previous = connection.tasks().reconnect.replace(handle);
                    if let Some(previous) = previous {
                        previous.abort();
                    }
                }
                Effect::CancelTimers => connection.tasks().abort_all(),
                Effect::PublishFailure { attempts } => {
                    let err = RealtimeError::ConnectionFailed {
                        conversation_id: key.conversation_id.clone(),
                        user_id: key.user_id.clone(),
                        attempts,
                    };
                    error!(
                        conversation_id = %key.conversation_id,
                        user_id = %key.user_id,
                        attempts,
                        "realtime: giving up on reconnection"
                    );
                    if let Some(client) = inner.client.take() {
                        self.close_client(key, client).await;
                    }
                    let _ = self.events.send(RealtimeEvent::ConnectionFailed {
                        conversation_id: key.conversation_id.clone(),
                        user_id: key.user_id.clone(),
                        error: ApiError::from(&err),
                    });
                }
            }
        }
    }

    async fn join_channels(
        &self,
        key: &ConnectionKey,
        client: &Arc<dyn PubSubClient>,
        connection_id: Option<String>,
    ) {
        for channel in essential_channels(&key.conversation_id, &key.user_id) {
            self.channels.join(key, &channel, self.clock.now()).await;
            if let Err(err) = within(self.operation_timeout(), "attach", client.attach(&channel)).await {
                warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, channel, error = %err, "realtime: attach failed");
                continue;
            }
            if channel_kind(&channel).is_some_and(ChannelKind::is_user_facing) {
                self.enter_presence(key, client, &channel, PresenceAction::Joined, connection_id.clone())
                    .await;
            }
        }
    }

    async fn replay_channels(
        &self,
        key: &ConnectionKey,
        client: &Arc<dyn PubSubClient>,
        connection_id: Option<String>,
    ) {
        for joined in self.channels.list_channels(key).await {
            let attached =
                within(self.operation_timeout(), "attach", client.attach(&joined.name)).await;
            if let Err(err) = attached {
                warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, channel = joined.name, error = %err, "realtime: re-attach failed");
                continue;
            }
            if joined.presence_entered {
                self.enter_presence(
                    key,
                    client,
                    &joined.name,
                    PresenceAction::Reconnected,
                    connection_id.clone(),
                )
                .await;
            }
        }
    }

    async fn enter_presence(
        &self,
        key: &ConnectionKey,
        client: &Arc<dyn PubSubClient>,
        channel: &str,
        action: PresenceAction,
        connection_id: Option<String>,
    ) {
        let data = presence_payload(&key.user_id, action, self.clock.now(), connection_id);
        let entered = within(
            self.operation_timeout(),
            "presence enter",
            client.enter_presence(channel, data),
        )
        .await;
        match entered {
            Ok(()) => {
                self.channels.set_presence(key, channel, true).await;
            }
            Err(source) => {
                let err = RealtimeError::Presence {
                    channel: channel.to_string(),
                    source,
                };
                warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, error = %err, "realtime: presence enter failed");
            }
        }
    }

    /// Hands queued messages to the user's subscribers. Entries nobody
    /// received stay queued for the next connect or for
    /// `acknowledge_messages`.
    async fn deliver_offline(&self, key: &ConnectionKey) {
        let queued = self
            .offline_queue
            .drain(&key.user_id, &key.conversation_id)
            .await;
        if queued.is_empty() {
            return;
        }

        let mut delivered = 0;
        let mut skipped = Vec::new();
        let mut kept = 0;
        for entry in queued {
            if entry.retry_count > 0 {
                self.deliveries.record_retry(entry.message_id()).await;
            }
            let message_id = entry.message_id().clone();
            match self.receive(&key.user_id, entry.message).await {
                Handoff::Delivered => delivered += 1,
                Handoff::Skipped => skipped.push(message_id),
                Handoff::NoListener => kept += 1,
            }
        }
        if !skipped.is_empty() {
            self.offline_queue
                .acknowledge(&key.user_id, &key.conversation_id, &skipped)
                .await;
        }
        info!(
            conversation_id = %key.conversation_id,
            user_id = %key.user_id,
            delivered,
            skipped = skipped.len(),
            kept,
            "realtime: handed over queued messages"
        );
    }

    /// Receive path shared by live and queued messages. A delivered message
    /// is confirmed and removed from the user's offline queue.
    async fn receive(&self, user_id: &UserId, message: ConversationMessage) -> Handoff {
        if !message.is_addressed_to(user_id) {
            return Handoff::Skipped;
        }
        if self.events.receiver_count() == 0 {
            debug!(%user_id, message_id = %message.message_id, "realtime: no event subscriber, message not handed over");
            return Handoff::NoListener;
        }
        let seen = (user_id.clone(), message.message_id.clone());
        if self.duplicates.check_and_mark(seen.clone()).await {
            debug!(%user_id, message_id = %message.message_id, "realtime: duplicate message suppressed");
            return Handoff::Skipped;
        }

        let conversation_id = message.conversation_id.clone();
        let message_id = message.message_id.clone();
        self.deliveries.confirm_delivery(&message_id, user_id).await;
        let sent = self.events.send(RealtimeEvent::MessageReceived {
            user_id: user_id.clone(),
            message,
        });
        if sent.is_err() {
            self.duplicates.forget(&seen).await;
            debug!(%user_id, %message_id, "realtime: event subscribers left, message not handed over");
            return Handoff::NoListener;
        }
        self.offline_queue
            .acknowledge(user_id, &conversation_id, slice::from_ref(&message_id))
            .await;
        Handoff::Delivered
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        connection: &Arc<ManagedConnection>,
        client: Arc<dyn PubSubClient>,
        mut states: StateReceiver,
        generation: u64,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            loop {
                let lost = match states.recv().await {
                    Ok(change) if change.current.is_connection_loss() => Some(
                        change
                            .reason
                            .unwrap_or_else(|| format!("transport {:?}", change.current)),
                    ),
                    Ok(_) => None,
                    Err(RecvError::Lagged(_)) => client
                        .state()
                        .is_connection_loss()
                        .then(|| "transport lost while lifecycle events lagged".to_string()),
                    Err(RecvError::Closed) => break,
                };
                if let Some(reason) = lost {
                    tokio::spawn(supervisor.handle_transport_loss(connection, generation, reason));
                    break;
                }
            }
        })
    }

    fn spawn_health_monitor(
        self: &Arc<Self>,
        connection: &Arc<ManagedConnection>,
        client: Arc<dyn PubSubClient>,
        generation: u64,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let connection = Arc::clone(connection);
        let period = self.settings.health_check_interval();
        let threshold = self.settings.latency_warning();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match within(period, "health probe", client.ping()).await {
                    Ok(latency) => {
                        if latency > threshold {
                            warn!(
                                conversation_id = %connection.key.conversation_id,
                                user_id = %connection.key.user_id,
                                latency_ms = latency.as_millis() as u64,
                                threshold_ms = threshold.as_millis() as u64,
                                "realtime: high latency"
                            );
                        }
                        supervisor.record_latency(&connection, generation, latency).await;
                    }
                    Err(err) => {
                        debug!(conversation_id = %connection.key.conversation_id, user_id = %connection.key.user_id, error = %err, "realtime: health probe failed");
                    }
                }
                if client.state() != TransportState::Connected {
                    tokio::spawn(supervisor.handle_transport_loss(
                        connection,
                        generation,
                        "health check found transport down".to_string(),
                    ));
                    break;
                }
            }
        })
    }

    fn spawn_inbound(
        self: &Arc<Self>,
        key: ConnectionKey,
        mut messages: broadcast::Receiver<InboundMessage>,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let channel = conversation_channel(&key.conversation_id);
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(inbound) => {
                        if inbound.channel != channel || inbound.name != MESSAGE_EVENT_NAME {
                            continue;
                        }
                        match serde_json::from_value::<ConversationMessage>(inbound.data) {
                            Ok(message) => {
                                supervisor.receive(&key.user_id, message).await;
                            }
                            Err(err) => {
                                let err = RealtimeError::from(err);
                                warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, error = %err, "realtime: dropping malformed message");
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, skipped, "realtime: inbound messages lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn record_latency(&self, connection: &ManagedConnection, generation: u64, latency: Duration) {
        let mut inner = connection.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        inner.latency = Some(latency);
        connection.refresh_view(&inner);
    }

    fn handle_transport_loss(
        self: Arc<Self>,
        connection: Arc<ManagedConnection>,
        generation: u64,
        reason: String,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut inner = connection.inner.lock().await;
            if inner.generation != generation
                || inner.machine.status != ConnectionStatus::Connected
                || !self.is_registered(&connection).await
            {
                debug!(conversation_id = %connection.key.conversation_id, user_id = %connection.key.user_id, reason, "realtime: ignoring stale transport loss");
                return;
            }

            warn!(
                conversation_id = %connection.key.conversation_id,
                user_id = %connection.key.user_id,
                reason,
                "realtime: transport lost"
            );
            let next = transition(&inner.machine, Event::TransportLost, &self.policy);
            inner.machine = next.state;
            self.execute(&connection, &mut inner, next.effects).await;
            self.publish_state(&connection, &inner);
        }
        .boxed()
    }

    fn attempt_reconnect(
        self: Arc<Self>,
        connection: Arc<ManagedConnection>,
        generation: u64,
        delay: Duration,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;

            let mut inner = connection.inner.lock().await;
            if inner.generation != generation
                || !inner.machine.is_reconnecting()
                || !self.is_registered(&connection).await
            {
                return;
            }
            // Past this point nothing may abort this task; later effects
            // replace the handle slot with their own tasks.
            let _detached = connection.tasks().reconnect.take();

            let key = &connection.key;
            let attempt = inner.machine.reconnect_attempts;
            if let Some(stale) = inner.client.take() {
                self.close_client(key, stale).await;
            }

            match self.open_transport(key).await {
                Ok((client, states)) => {
                    self.install_client(&connection, &mut inner, client, states);
                    let next = transition(&inner.machine, Event::TransportConnected, &self.policy);
                    inner.machine = next.state;
                    info!(
                        conversation_id = %key.conversation_id,
                        user_id = %key.user_id,
                        attempt,
                        "realtime: reconnected"
                    );
                    self.execute(&connection, &mut inner, next.effects).await;
                }
                Err(err) => {
                    warn!(
                        conversation_id = %key.conversation_id,
                        user_id = %key.user_id,
                        attempt,
                        error = %err,
                        "realtime: reconnect attempt failed"
                    );
                    let next =
                        transition(&inner.machine, Event::ReconnectAttemptFailed, &self.policy);
                    inner.machine = next.state;
                    self.execute(&connection, &mut inner, next.effects).await;
                }
            }
            self.publish_state(&connection, &inner);
        }
        .boxed()
    }

    /// Cancels the connection's tasks and releases its transport. When a
    /// connect or reconnect still holds the connection past the cleanup
    /// timeout, the rest of the teardown runs in the background once it
    /// lets go.
    async fn teardown(self: &Arc<Self>, connection: &Arc<ManagedConnection>) {
        connection.tasks().abort_all();
        let cleanup = self.settings.cleanup_timeout();
        match tokio::time::timeout(cleanup, connection.inner.lock()).await {
            Ok(mut inner) => self.finish_teardown(connection, &mut inner).await,
            Err(_) => {
                warn!(
                    conversation_id = %connection.key.conversation_id,
                    user_id = %connection.key.user_id,
                    "realtime: connection busy, finishing disconnect in the background"
                );
                let supervisor = Arc::clone(self);
                let connection = Arc::clone(connection);
                tokio::spawn(async move {
                    let mut inner = connection.inner.lock().await;
                    supervisor.finish_teardown(&connection, &mut inner).await;
                });
            }
        }
    }

    async fn finish_teardown(&self, connection: &Arc<ManagedConnection>, inner: &mut ConnectionInner) {
        let key = &connection.key;
        // A connect or reconnect that held the lock may have spawned fresh tasks.
        connection.tasks().abort_all();
        inner.machine = transition(&inner.machine, Event::DisconnectRequested, &self.policy).state;

        if let Some(client) = inner.client.take() {
            if client.state() == TransportState::Connected {
                let cleanup = self.settings.cleanup_timeout();
                for channel in self.channels.presence_channels(key).await {
                    let data = presence_payload(
                        &key.user_id,
                        PresenceAction::Left,
                        self.clock.now(),
                        inner.connection_id.clone(),
                    );
                    let left =
                        within(cleanup, "presence leave", client.leave_presence(&channel, data)).await;
                    if let Err(err) = left {
                        warn!(conversation_id = %key.conversation_id, user_id = %key.user_id, channel, error = %err, "realtime: presence leave failed");
                    }
                }
            }
            self.close_client(key, client).await;
        }

        // A connect issued after the removal owns the key's channels now.
        if self.lookup(key).await.is_none() {
            self.channels.remove(key).await;
        }
        info!(conversation_id = %key.conversation_id, user_id = %key.user_id, "realtime: disconnected");
        self.publish_state(connection, inner);
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
