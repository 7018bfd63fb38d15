//! Connection lifecycle as a pure transition function.
//!
//! ```text
//! disconnected --connect--> connecting --connected--> connected
//!                                |                       |
//!                             failure                   lost
//!                                v                       v
//!                             failed <--exhausted-- disconnected (reconnecting)
//!                                                        |
//!                                                    connected
//! ```
//!
//! The supervisor feeds events in and executes the returned effects; nothing
//! here touches the transport or the clock.

use std::time::Duration;

use shared::domain::ConnectionStatus;

pub const DEFAULT_BACKOFF_TABLE: [Duration; 6] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(30),
];
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_TABLE.to_vec(), DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

impl BackoffPolicy {
    /// An empty table falls back to the default one.
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        let delays = if delays.is_empty() {
            DEFAULT_BACKOFF_TABLE.to_vec()
        } else {
            delays
        };
        Self {
            delays,
            max_attempts,
        }
    }

    /// Delay before the reconnect that follows `attempts` earlier ones. The
    /// last table entry repeats once the table is exhausted.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let index = (attempts as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
        }
    }
}

impl MachineState {
    /// State of a connection that has just been created.
    pub fn connecting() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status == ConnectionStatus::Disconnected && self.reconnect_attempts > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ConnectRequested,
    TransportConnected,
    /// The transport reported disconnected, suspended or failed, or the
    /// health probe found it no longer connected.
    TransportLost,
    /// The initial open timed out or was refused.
    ConnectFailed,
    ReconnectAttemptFailed,
    DisconnectRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StartHealthMonitor,
    StopHealthMonitor,
    /// Join the essential channels and enter presence as `joined`.
    JoinChannels,
    /// Re-attach recorded channels and re-enter presence as `reconnected`.
    ReplayChannels,
    DrainOfflineQueue,
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelTimers,
    /// Attempts are exhausted; announce the terminal failure.
    PublishFailure { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: MachineState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &MachineState) -> Self {
        Self {
            state: *state,
            effects: Vec::new(),
        }
    }

    fn to(status: ConnectionStatus, reconnect_attempts: u32, effects: Vec<Effect>) -> Self {
        Self {
            state: MachineState {
                status,
                reconnect_attempts,
            },
            effects,
        }
    }

    pub fn is_noop(&self, previous: &MachineState) -> bool {
        self.state == *previous && self.effects.is_empty()
    }
}

pub fn transition(state: &MachineState, event: Event, policy: &BackoffPolicy) -> Transition {
    use ConnectionStatus::*;

    match (state.status, event) {
        (Connected | Connecting, Event::ConnectRequested) => Transition::unchanged(state),
        (Disconnected | Failed, Event::ConnectRequested) => {
            Transition::to(Connecting, 0, Vec::new())
        }

        (Connecting, Event::TransportConnected) => Transition::to(
            Connected,
            0,
            vec![
                Effect::StartHealthMonitor,
                Effect::JoinChannels,
                Effect::DrainOfflineQueue,
            ],
        ),
        (Disconnected, Event::TransportConnected) if state.reconnect_attempts > 0 => {
            Transition::to(
                Connected,
                0,
                vec![
                    Effect::StartHealthMonitor,
                    Effect::ReplayChannels,
                    Effect::DrainOfflineQueue,
                ],
            )
        }

        // Initial connect failures are not retried.
        (Connecting, Event::ConnectFailed) => {
            Transition::to(Failed, state.reconnect_attempts, vec![Effect::CancelTimers])
        }

        (Connected, Event::TransportLost) => {
            let mut next = schedule_reconnect(state, policy);
            next.effects.insert(0, Effect::StopHealthMonitor);
            next
        }
        (Disconnected, Event::ReconnectAttemptFailed | Event::ConnectFailed)
            if state.reconnect_attempts > 0 =>
        {
            schedule_reconnect(state, policy)
        }

        (_, Event::DisconnectRequested) => {
            Transition::to(Disconnected, 0, vec![Effect::CancelTimers])
        }

        _ => Transition::unchanged(state),
    }
}

fn schedule_reconnect(state: &MachineState, policy: &BackoffPolicy) -> Transition {
    if state.reconnect_attempts >= policy.max_attempts() {
        return Transition::to(
            ConnectionStatus::Failed,
            state.reconnect_attempts,
            vec![
                Effect::CancelTimers,
                Effect::PublishFailure {
                    attempts: state.reconnect_attempts,
                },
            ],
        );
    }
    let delay = policy.delay_for(state.reconnect_attempts);
    let attempt = state.reconnect_attempts + 1;
    Transition::to(
        ConnectionStatus::Disconnected,
        attempt,
        vec![Effect::ScheduleReconnect { attempt, delay }],
    )
}

#[cfg(test)]
#[path = "tests/state_machine_tests.rs"]
mod tests;
