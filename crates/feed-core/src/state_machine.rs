use crate::{error::FeedError, types::ConnectionStatus};

/// Outcome of entering `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveEntry {
    /// `true` when `Live` was reached from `Degraded`.
    pub reconnect: bool,
}

/// `Idle -> Connecting -> Live -> (Degraded <-> Live) -> Disconnected`.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionStatus,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionStatus::Idle,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionStatus {
        self.state
    }

    pub fn on_connect(&mut self) -> Result<ConnectionStatus, FeedError> {
        self.transition_from_any_of(
            &[ConnectionStatus::Idle],
            ConnectionStatus::Connecting,
            "connect",
        )
    }

    pub fn on_connected(&mut self) -> Result<LiveEntry, FeedError> {
        let reconnect = self.state == ConnectionStatus::Degraded;
        self.transition_from_any_of(
            &[ConnectionStatus::Connecting, ConnectionStatus::Degraded],
            ConnectionStatus::Live,
            "connected",
        )?;
        Ok(LiveEntry { reconnect })
    }

    /// Returns `Some` only when the status actually changed; repeated
    /// failures while already `Degraded` are not a transition.
    pub fn on_transport_lost(&mut self) -> Result<Option<ConnectionStatus>, FeedError> {
        if self.state == ConnectionStatus::Degraded {
            return Ok(None);
        }
        self.transition_from_any_of(
            &[ConnectionStatus::Connecting, ConnectionStatus::Live],
            ConnectionStatus::Degraded,
            "transport_lost",
        )
        .map(Some)
    }

    pub fn on_closed(&mut self) -> Option<ConnectionStatus> {
        if self.state == ConnectionStatus::Disconnected {
            return None;
        }
        self.state = ConnectionStatus::Disconnected;
        Some(self.state)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionStatus],
        next: ConnectionStatus,
        action: &str,
    ) -> Result<ConnectionStatus, FeedError> {
        if !expected.contains(&self.state) {
            return Err(FeedError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
