//! In-process pub/sub broker.
//!
//! Fans published messages out to every connected client attached to the
//! channel, keeps presence membership per channel and lets the owner steer
//! connection lifecycles (handshake outcome, forced interruptions, probe
//! latency). Used for local runs and as the transport in tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    capability::{verify_token, CapabilitySet, Operation, TokenConfig},
    ClientOptions, InboundMessage, PresenceMember, PubSubClient, PubSubConnector, TransportState,
    TransportStateChange, PRESENCE_ENTER_EVENT, PRESENCE_LEAVE_EVENT,
};

const CLIENT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeMode {
    /// Clients reach `Connected` right after opening.
    #[default]
    Accept,
    /// Clients stay `Connecting` forever.
    Stall,
    /// `open` fails immediately.
    Refuse,
}

/// Client calls the broker can be told to hang on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StalledCall {
    Attach,
    Ping,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

#[derive(Default)]
struct BrokerShared {
    verification: Option<TokenConfig>,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    handshake: HandshakeMode,
    probe_latency: Duration,
    stalled: HashSet<StalledCall>,
    opened: usize,
    next_connection: u64,
    clients: HashMap<String, Weak<MemoryClient>>,
    presence: HashMap<String, BTreeMap<String, PresenceMember>>,
    published: Vec<InboundMessage>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects clients whose token does not verify and enforces the
    /// capabilities it carries.
    pub fn with_token_verification(config: TokenConfig) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                verification: Some(config),
                state: Mutex::default(),
            }),
        }
    }

    pub fn set_handshake(&self, mode: HandshakeMode) {
        lock(&self.shared.state).handshake = mode;
    }

    pub fn set_probe_latency(&self, latency: Duration) {
        lock(&self.shared.state).probe_latency = latency;
    }

    /// While set, `call` on any client of this broker never completes.
    pub fn set_stalled(&self, call: StalledCall, stalled: bool) {
        let mut state = lock(&self.shared.state);
        if stalled {
            state.stalled.insert(call);
        } else {
            state.stalled.remove(&call);
        }
    }

    /// Number of `open` calls seen so far, refused ones included.
    pub fn open_count(&self) -> usize {
        lock(&self.shared.state).opened
    }

    pub fn live_clients(&self) -> usize {
        self.clients().len()
    }

    /// Moves every live client with `client_id` to `state`, announcing the
    /// change. Returns how many clients were affected.
    pub fn interrupt(&self, client_id: &str, state: TransportState) -> usize {
        let targets: Vec<_> = self
            .clients()
            .into_iter()
            .filter(|client| client.client_id == client_id)
            .collect();
        for client in &targets {
            client.transition(state, Some("interrupted by broker".into()));
        }
        targets.len()
    }

    pub fn interrupt_all(&self, state: TransportState) -> usize {
        let targets = self.clients();
        for client in &targets {
            client.transition(state, Some("interrupted by broker".into()));
        }
        targets.len()
    }

    /// Drops the link of every client with `client_id` without emitting a
    /// lifecycle event, as if the event had been lost on the wire.
    pub fn drop_silently(&self, client_id: &str) -> usize {
        let targets: Vec<_> = self
            .clients()
            .into_iter()
            .filter(|client| client.client_id == client_id)
            .collect();
        for client in &targets {
            *lock(&client.status) = TransportState::Disconnected;
        }
        targets.len()
    }

    pub fn presence_members(&self, channel: &str) -> Vec<PresenceMember> {
        lock(&self.shared.state)
            .presence
            .get(channel)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn published(&self, channel: &str) -> Vec<InboundMessage> {
        lock(&self.shared.state)
            .published
            .iter()
            .filter(|message| message.channel == channel)
            .cloned()
            .collect()
    }

    fn clients(&self) -> Vec<Arc<MemoryClient>> {
        let mut state = lock(&self.shared.state);
        state.clients.retain(|_, client| client.strong_count() > 0);
        state.clients.values().filter_map(Weak::upgrade).collect()
    }
}

impl BrokerShared {
    async fn hang_if_stalled(&self, call: StalledCall) {
        let stalled = lock(&self.state).stalled.contains(&call);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn fan_out(&self, message: InboundMessage) {
        let targets: Vec<Arc<MemoryClient>> = {
            let mut state = lock(&self.state);
            state.published.push(message.clone());
            state.clients.values().filter_map(Weak::upgrade).collect()
        };
        for client in targets {
            if client.state() == TransportState::Connected
                && lock(&client.attached).contains(&message.channel)
            {
                let _ = client.messages.send(message.clone());
            }
        }
    }

    fn forget_connection(&self, connection_id: &str) {
        let mut state = lock(&self.state);
        state.clients.remove(connection_id);
        for members in state.presence.values_mut() {
            members.remove(connection_id);
        }
    }
}

#[async_trait]
impl PubSubConnector for MemoryBroker {
    async fn open(&self, options: ClientOptions) -> anyhow::Result<Arc<dyn PubSubClient>> {
        let capabilities = match &self.shared.verification {
            Some(config) => Some(
                verify_token(config, &options.token)
                    .with_context(|| format!("token rejected for client {}", options.client_id))?
                    .capability,
            ),
            None => None,
        };

        let (handshake, connection_id) = {
            let mut state = lock(&self.shared.state);
            state.opened += 1;
            state.next_connection += 1;
            (state.handshake, format!("mem-{}", state.next_connection))
        };

        if handshake == HandshakeMode::Refuse {
            bail!("connection refused for client {}", options.client_id);
        }

        let (states, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        let (messages, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        let client = Arc::new(MemoryClient {
            broker: Arc::clone(&self.shared),
            client_id: options.client_id,
            connection_id: connection_id.clone(),
            capabilities,
            status: Mutex::new(TransportState::Connecting),
            attached: Mutex::new(HashSet::new()),
            states,
            messages,
        });
        lock(&self.shared.state)
            .clients
            .insert(connection_id, Arc::downgrade(&client));

        if handshake == HandshakeMode::Accept {
            let pending = Arc::clone(&client);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                if pending.state() == TransportState::Connecting {
                    pending.transition(TransportState::Connected, None);
                }
            });
        }

        debug!(client_id = %client.client_id, connection_id = %client.connection_id, "memory broker: client opened");
        Ok(client)
    }
}

pub struct MemoryClient {
    broker: Arc<BrokerShared>,
    client_id: String,
    connection_id: String,
    capabilities: Option<CapabilitySet>,
    status: Mutex<TransportState>,
    attached: Mutex<HashSet<String>>,
    states: broadcast::Sender<TransportStateChange>,
    messages: broadcast::Sender<InboundMessage>,
}

impl MemoryClient {
    fn transition(&self, next: TransportState, reason: Option<String>) {
        let previous = {
            let mut status = lock(&self.status);
            if *status == next {
                return;
            }
            std::mem::replace(&mut *status, next)
        };
        let _ = self.states.send(TransportStateChange {
            previous,
            current: next,
            reason,
        });
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            bail!(
                "client {} is not connected (state {state:?})",
                self.client_id
            );
        }
        Ok(())
    }

    fn ensure_allowed(&self, channel: &str, operation: Operation) -> anyhow::Result<()> {
        if let Some(capabilities) = &self.capabilities {
            if !capabilities.allows(channel, operation) {
                bail!(
                    "client {} lacks {operation:?} capability on {channel}",
                    self.client_id
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubClient for MemoryClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn connection_id(&self) -> Option<String> {
        Some(self.connection_id.clone())
    }

    fn state(&self) -> TransportState {
        *lock(&self.status)
    }

    fn subscribe_state(&self) -> broadcast::Receiver<TransportStateChange> {
        self.states.subscribe()
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    async fn attach(&self, channel: &str) -> anyhow::Result<()> {
        self.broker.hang_if_stalled(StalledCall::Attach).await;
        self.ensure_connected()?;
        self.ensure_allowed(channel, Operation::Subscribe)?;
        lock(&self.attached).insert(channel.to_string());
        Ok(())
    }

    async fn detach(&self, channel: &str) -> anyhow::Result<()> {
        lock(&self.attached).remove(channel);
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        name: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.ensure_connected()?;
        self.ensure_allowed(channel, Operation::Publish)?;
        self.broker.fan_out(InboundMessage {
            channel: channel.to_string(),
            name: name.to_string(),
            data,
            publisher_client_id: self.client_id.clone(),
        });
        Ok(())
    }

    async fn enter_presence(&self, channel: &str, data: serde_json::Value) -> anyhow::Result<()> {
        self.ensure_connected()?;
        self.ensure_allowed(channel, Operation::Presence)?;
        lock(&self.broker.state)
            .presence
            .entry(channel.to_string())
            .or_default()
            .insert(
                self.connection_id.clone(),
                PresenceMember {
                    client_id: self.client_id.clone(),
                    connection_id: self.connection_id.clone(),
                    data: data.clone(),
                },
            );
        self.broker.fan_out(InboundMessage {
            channel: channel.to_string(),
            name: PRESENCE_ENTER_EVENT.to_string(),
            data,
            publisher_client_id: self.client_id.clone(),
        });
        Ok(())
    }

    async fn leave_presence(&self, channel: &str, data: serde_json::Value) -> anyhow::Result<()> {
        self.ensure_connected()?;
        let removed = lock(&self.broker.state)
            .presence
            .get_mut(channel)
            .and_then(|members| members.remove(&self.connection_id));
        if removed.is_none() {
            bail!(
                "client {} is not present on {channel}",
                self.client_id
            );
        }
        self.broker.fan_out(InboundMessage {
            channel: channel.to_string(),
            name: PRESENCE_LEAVE_EVENT.to_string(),
            data,
            publisher_client_id: self.client_id.clone(),
        });
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<Duration> {
        self.broker.hang_if_stalled(StalledCall::Ping).await;
        self.ensure_connected()?;
        Ok(lock(&self.broker.state).probe_latency)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.transition(TransportState::Closed, None);
        lock(&self.attached).clear();
        self.broker.forget_connection(&self.connection_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
