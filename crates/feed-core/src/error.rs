use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionStatus;

/// Broad error category driving recovery and surfacing policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedErrorKind {
    /// Push transport dropped or could not connect. Recovered by reconnect
    /// and backfill; only visible as `Degraded`.
    Transport,
    /// History page fetch failed. Surfaced; retry via `RequestOlderPage`.
    Fetch,
    /// Repository write failed. Surfaced on the pending entry, never
    /// retried automatically.
    Write,
    /// Push frame could not be decoded. Logged and dropped.
    Protocol,
    /// Operation abandoned because its scope was torn down.
    Cancelled,
    /// Invalid input or configuration.
    Config,
    /// Invariant break inside the feed.
    Internal,
}

/// Stable feed error payload carried through state snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{code}: {message}")]
pub struct FeedError {
    pub kind: FeedErrorKind,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl FeedError {
    pub fn new(kind: FeedErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::Transport, code, message)
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::Fetch, "fetch_failed", message)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::Write, "write_failed", message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FeedErrorKind::Protocol, "malformed_event", message)
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(
            FeedErrorKind::Cancelled,
            "cancelled",
            format!("{operation} was cancelled by scope teardown"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionStatus, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            FeedErrorKind::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {current:?}"),
        )
    }

    /// Faults the feed recovers from on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind, FeedErrorKind::Transport | FeedErrorKind::Protocol)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FeedErrorKind::Cancelled
    }
}
