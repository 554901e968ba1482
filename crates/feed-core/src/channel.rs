use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{FeedCommand, FeedState};

/// Broadcast state stream used by presentation subscribers.
pub type StateStream = broadcast::Receiver<FeedState>;

/// Errors returned by feed channel operations.
#[derive(Debug, Error)]
pub enum FeedChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/state channel pair shared by the runtime and its handles.
#[derive(Clone, Debug)]
pub struct FeedChannels {
    command_tx: mpsc::Sender<FeedCommand>,
    state_tx: broadcast::Sender<FeedState>,
}

impl FeedChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, state_buffer: usize) -> (Self, mpsc::Receiver<FeedCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (state_tx, _) = broadcast::channel(state_buffer.max(1));

        (
            Self {
                command_tx,
                state_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to published feed states.
    pub fn subscribe(&self) -> StateStream {
        self.state_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: FeedCommand) -> Result<(), FeedChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| FeedChannelError::CommandChannelClosed)
    }
}

/// Publishing side held by the runtime.
///
/// It carries no command sender, so the runtime's command receiver closes
/// once the last handle is dropped.
#[derive(Clone, Debug)]
pub struct StatePublisher {
    state_tx: broadcast::Sender<FeedState>,
}

impl StatePublisher {
    /// Publish a state to all subscribers.
    ///
    /// Best-effort; lagged subscribers are handled by `broadcast`.
    pub fn publish(&self, state: FeedState) {
        let _ = self.state_tx.send(state);
    }

    pub fn subscribe(&self) -> StateStream {
        self.state_tx.subscribe()
    }
}

impl FeedChannels {
    pub fn state_publisher(&self) -> StatePublisher {
        StatePublisher {
            state_tx: self.state_tx.clone(),
        }
    }
}
