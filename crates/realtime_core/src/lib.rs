//! Realtime conversation transport: per-(conversation, user) connections
//! over a pub/sub service, with reconnection, delivery tracking, offline
//! queueing and duplicate suppression.

pub mod channels;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod events;
pub mod offline_queue;
pub mod sequence;
pub mod state_machine;
pub mod supervisor;
pub mod transport;

pub use channels::{ChannelRegistry, ConnectionKey, JoinedChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, RealtimeSettings};
pub use dedup::DuplicateFilter;
pub use delivery::{DeliveryTracker, MessageDelivery};
pub use error::RealtimeError;
pub use events::RealtimeEvent;
pub use offline_queue::{OfflineQueue, OfflineQueueConfig, QueueStats, QueuedMessage};
pub use sequence::{ConversationSequence, SequenceAllocator};
pub use state_machine::BackoffPolicy;
pub use supervisor::ConnectionSupervisor;
pub use transport::{MaintenanceReport, RealtimeTransport};
