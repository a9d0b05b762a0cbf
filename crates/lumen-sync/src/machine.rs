use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Opened,
    Closed,
    Failed,
    ReconnectDue,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenTransport,
    CloseTransport,
    ScheduleReconnect(Duration),
    CancelReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transition {
    pub actions: Vec<Action>,
    pub visited: Vec<ConnectionState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    wanted: bool,
    reconnect_pending: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            wanted: false,
            reconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Transition {
        let mut tx = Transition::default();
        match event {
            ConnectionEvent::Connect => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    return tx;
                }
                self.wanted = true;
                self.attempts = 0;
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    tx.actions.push(Action::CancelReconnect);
                }
                self.enter(ConnectionState::Connecting, &mut tx);
                tx.actions.push(Action::OpenTransport);
            }
            ConnectionEvent::Opened => {
                if self.state == ConnectionState::Connecting && self.wanted {
                    self.attempts = 0;
                    self.enter(ConnectionState::Connected, &mut tx);
                } else {
                    tx.actions.push(Action::CloseTransport);
                }
            }
            ConnectionEvent::Closed | ConnectionEvent::Failed => {
                if !matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    return tx;
                }
                if event == ConnectionEvent::Failed {
                    self.enter(ConnectionState::Error, &mut tx);
                }
                self.enter(ConnectionState::Disconnected, &mut tx);
                if !self.wanted {
                    return tx;
                }
                if self.attempts < self.policy.max_attempts {
                    let delay = self.policy.delay(self.attempts);
                    self.attempts += 1;
                    self.reconnect_pending = true;
                    tx.actions.push(Action::ScheduleReconnect(delay));
                } else {
                    self.wanted = false;
                }
            }
            ConnectionEvent::ReconnectDue => {
                if !self.reconnect_pending
                    || !self.wanted
                    || self.state != ConnectionState::Disconnected
                {
                    return tx;
                }
                self.reconnect_pending = false;
                self.enter(ConnectionState::Connecting, &mut tx);
                tx.actions.push(Action::OpenTransport);
            }
            ConnectionEvent::Disconnect => {
                self.wanted = false;
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    tx.actions.push(Action::CancelReconnect);
                }
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    tx.actions.push(Action::CloseTransport);
                    self.enter(ConnectionState::Disconnected, &mut tx);
                }
            }
        }
        tx
    }

    fn enter(&mut self, state: ConnectionState, tx: &mut Transition) {
        self.state = state;
        tx.visited.push(state);
    }
}
