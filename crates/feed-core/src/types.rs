use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Repository-assigned message identifier.
///
/// Ids are totally ordered and increase monotonically on insert. They are the
/// only ordering and dedupe key used by the feed.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Origin marker attached to a message by the ingestion path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OriginTag {
    /// Sent by a signed-in account.
    Authenticated,
    /// Sent by a guest with a generated handle.
    Anonymous,
}

/// Conversation identity a feed is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The global feed shared by everyone.
    Global,
    /// A team-scoped feed.
    Team(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Team(team_id) => write!(f, "team:{team_id}"),
        }
    }
}

/// Confirmed, immutable message record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Repository-assigned id.
    pub id: MessageId,
    /// Display name of the sender (may be guest-generated).
    pub author_handle: String,
    /// Sanitized text body.
    pub body: String,
    /// Authenticated vs anonymous origin.
    pub origin_tag: OriginTag,
    /// Server timestamp in milliseconds since Unix epoch. Display only.
    pub created_at_ms: u64,
}

/// Fields supplied by the local user when sending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub author_handle: String,
    pub origin_tag: OriginTag,
}

impl OutgoingMessage {
    pub fn new(
        body: impl Into<String>,
        author_handle: impl Into<String>,
        origin_tag: OriginTag,
    ) -> Self {
        Self {
            body: body.into(),
            author_handle: author_handle.into(),
            origin_tag,
        }
    }
}

/// Lifecycle of an optimistic send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// Write submitted, no result yet.
    Sending,
    /// Write returned an id; waiting for the echo.
    Confirmed,
    /// Write failed; kept for a user retry.
    Failed,
}

/// Locally rendered, not-yet-merged outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    /// Locally unique temporary key.
    pub temp_key: String,
    pub author_handle: String,
    pub body: String,
    pub origin_tag: OriginTag,
    pub status: PendingStatus,
    /// Local submission time in milliseconds since Unix epoch.
    pub submitted_at_ms: u64,
    /// Id returned by the write, once known.
    pub confirmed_id: Option<MessageId>,
    /// Failure details when `status == Failed`.
    pub error: Option<FeedError>,
}

impl PendingMessage {
    /// Build a fresh `Sending` entry for a draft.
    pub fn sending(temp_key: impl Into<String>, draft: &OutgoingMessage, now_ms: u64) -> Self {
        Self {
            temp_key: temp_key.into(),
            author_handle: draft.author_handle.clone(),
            body: draft.body.clone(),
            origin_tag: draft.origin_tag,
            status: PendingStatus::Sending,
            submitted_at_ms: now_ms,
            confirmed_id: None,
            error: None,
        }
    }

    /// Draft to resubmit on retry.
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            body: self.body.clone(),
            author_handle: self.author_handle.clone(),
            origin_tag: self.origin_tag,
        }
    }
}

/// Live connection status reported to the presentation layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No subscription has been attempted yet.
    Idle,
    /// First subscription attempt is running.
    Connecting,
    /// Subscribed and receiving events.
    Live,
    /// Transport lost; reconnecting with backoff.
    Degraded,
    /// Torn down; no further events will arrive.
    Disconnected,
}

/// One page of history returned by the pagination path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Page {
    /// Messages ascending by id.
    pub messages: Vec<Message>,
    /// `true` when the repository has nothing older than this page.
    pub exhausted: bool,
}

/// Push event decoded from a live frame.
///
/// `Update` and `Delete` are reserved kinds; the feed accepts and ignores them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEvent {
    Insert { message: Message },
    Update { message: Message },
    Delete { id: MessageId },
}

/// Raw frame delivered by a push transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// Undecoded event payload.
    Event(serde_json::Value),
    /// The transport dropped the connection.
    TransportLost { reason: String },
}

/// Viewport measurements, with the oldest message at the top.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ViewportGeometry {
    /// Distance scrolled from the top of the content.
    pub offset_px: f32,
    /// Visible height.
    pub viewport_height_px: f32,
    /// Total rendered content height.
    pub content_height_px: f32,
}

/// Presentation-facing snapshot published after each change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedState {
    pub scope: Scope,
    /// Confirmed messages, oldest first.
    pub messages: Vec<Message>,
    /// Optimistic sends not yet merged.
    pub pending: Vec<PendingMessage>,
    /// Smallest loaded id, used as the pagination cursor.
    pub oldest_cursor: Option<MessageId>,
    pub has_more_history: bool,
    pub connection: ConnectionStatus,
    pub unread_count: u64,
    /// An older-page fetch is in flight.
    pub loading_older: bool,
    /// Most recent surfaced fetch or command error.
    pub last_error: Option<FeedError>,
}

impl FeedState {
    /// Empty state for a freshly opened scope.
    pub fn empty(scope: Scope) -> Self {
        Self {
            scope,
            messages: Vec::new(),
            pending: Vec::new(),
            oldest_cursor: None,
            has_more_history: true,
            connection: ConnectionStatus::Idle,
            unread_count: 0,
            loading_older: false,
            last_error: None,
        }
    }

    /// Ids of the confirmed messages in display order.
    pub fn message_ids(&self) -> Vec<u64> {
        self.messages.iter().map(|message| message.id.get()).collect()
    }
}

/// Command channel input accepted by the feed runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FeedCommand {
    /// Optimistically send a message.
    SendMessage { draft: OutgoingMessage },
    /// Explicitly load the next older page ("load more").
    RequestOlderPage,
    /// Viewport edge flags computed by the presentation layer.
    ViewportEdges { at_top: bool, at_bottom: bool },
    /// Raw viewport geometry; edges are derived with configured thresholds.
    ViewportScrolled(ViewportGeometry),
    /// Resubmit a failed pending send.
    RetrySend { temp_key: String },
    /// Drop a failed pending send.
    DiscardSend { temp_key: String },
    /// Tear down the current scope and open another one.
    SwitchScope { scope: Scope },
    /// Tear down and stop the runtime.
    Shutdown,
}
