//! Core contract of the message feed synchronizer.
//!
//! This crate holds the I/O-free parts: the data model, the ordered message
//! store, viewport/unread tracking, echo matching, backoff, the connection
//! state machine, collaborator traits and the command/state channels.

/// Command/state channel primitives.
pub mod channel;
/// Repository and push transport traits.
pub mod collaborators;
/// Stable feed error taxonomy.
pub mod error;
/// Matching optimistic sends against confirmed messages.
pub mod reconcile;
/// Backoff policy used by the reconnect loop.
pub mod retry;
/// Viewport tracking, auto-pagination trigger and unread counting.
pub mod scroll;
/// Live connection state machine.
pub mod state_machine;
/// Ordered, deduplicated message store.
pub mod store;
/// Data model, commands and published state.
pub mod types;

pub use channel::{FeedChannelError, FeedChannels, StatePublisher, StateStream};
pub use collaborators::{MessageRepository, PushChannel, PushSubscription};
pub use error::{FeedError, FeedErrorKind};
pub use reconcile::{find_echo, is_echo_of};
pub use retry::RetryPolicy;
pub use scroll::{
    DEFAULT_BOTTOM_THRESHOLD_PX, DEFAULT_TOP_THRESHOLD_PX, MergeOrigin, ScrollAnchor,
    ViewportAction, edges_for,
};
pub use state_machine::{ConnectionStateMachine, LiveEntry};
pub use store::{MergeResult, MessageStore};
pub use types::{
    ConnectionStatus, FeedCommand, FeedState, Message, MessageId, OriginTag, OutgoingMessage,
    Page, PendingMessage, PendingStatus, PushEvent, PushFrame, Scope, ViewportGeometry,
};
