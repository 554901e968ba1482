use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::FeedError,
    types::{Message, MessageId, OutgoingMessage, PushFrame, Scope},
};

/// Persistence collaborator for history reads and message writes.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Fetch up to `limit` messages, ascending by id.
    ///
    /// `cursor == None` means the latest `limit` messages; otherwise the
    /// newest `limit` messages with an id strictly below `cursor`.
    async fn fetch_page(
        &self,
        scope: &Scope,
        cursor: Option<MessageId>,
        limit: u16,
    ) -> Result<Vec<Message>, FeedError>;

    /// Persist a message and return the authoritative record.
    async fn insert(&self, scope: &Scope, draft: &OutgoingMessage) -> Result<Message, FeedError>;
}

/// Push transport collaborator.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open one subscription. Reconnects are driven by the caller.
    async fn subscribe(&self, scope: &Scope) -> Result<PushSubscription, FeedError>;
}

/// Live subscription handle. Dropping it unsubscribes.
#[derive(Debug)]
pub struct PushSubscription {
    frames: mpsc::Receiver<PushFrame>,
    unsubscribed: CancellationToken,
}

impl PushSubscription {
    /// `unsubscribed` is cancelled when the subscriber goes away so the
    /// transport can release the subscription.
    pub fn new(frames: mpsc::Receiver<PushFrame>, unsubscribed: CancellationToken) -> Self {
        Self {
            frames,
            unsubscribed,
        }
    }

    /// Next frame; `None` means the transport closed the stream.
    pub async fn next_frame(&mut self) -> Option<PushFrame> {
        self.frames.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.unsubscribed.cancel();
    }
}
