use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub mod capability;
pub mod memory;

pub use capability::{
    mint_token, user_capabilities, verify_token, CapabilitySet, Claims, IssuedToken,
    JwtTokenIssuer, Operation, TokenConfig, TokenIssuer,
};
pub use memory::{HandshakeMode, MemoryBroker, StalledCall};

/// Event name carried by presence notifications fanned out on a channel.
pub const PRESENCE_ENTER_EVENT: &str = "presence.enter";
pub const PRESENCE_LEAVE_EVENT: &str = "presence.leave";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl TransportState {
    /// States that mean an established link went away without being asked to.
    pub fn is_connection_loss(self) -> bool {
        matches!(self, Self::Disconnected | Self::Suspended | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStateChange {
    pub previous: TransportState,
    pub current: TransportState,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub client_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub name: String,
    pub data: serde_json::Value,
    pub publisher_client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMember {
    pub client_id: String,
    pub connection_id: String,
    pub data: serde_json::Value,
}

/// One live link to the pub/sub service. A client starts out `Connecting`;
/// lifecycle changes are announced on [`PubSubClient::subscribe_state`].
#[async_trait]
pub trait PubSubClient: Send + Sync {
    fn client_id(&self) -> &str;
    fn connection_id(&self) -> Option<String>;
    fn state(&self) -> TransportState;
    fn subscribe_state(&self) -> broadcast::Receiver<TransportStateChange>;
    fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage>;
    async fn attach(&self, channel: &str) -> anyhow::Result<()>;
    async fn detach(&self, channel: &str) -> anyhow::Result<()>;
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()>;
    async fn enter_presence(&self, channel: &str, data: serde_json::Value) -> anyhow::Result<()>;
    async fn leave_presence(&self, channel: &str, data: serde_json::Value) -> anyhow::Result<()>;
    /// Lightweight round trip used for latency measurement.
    async fn ping(&self) -> anyhow::Result<Duration>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PubSubConnector: Send + Sync {
    async fn open(&self, options: ClientOptions) -> anyhow::Result<Arc<dyn PubSubClient>>;
}

pub struct MissingPubSubConnector;

#[async_trait]
impl PubSubConnector for MissingPubSubConnector {
    async fn open(&self, options: ClientOptions) -> anyhow::Result<Arc<dyn PubSubClient>> {
        Err(anyhow!(
            "pub/sub transport is unavailable for client {}",
            options.client_id
        ))
    }
}
