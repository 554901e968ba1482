//! In-memory `MessageRepository` and `PushChannel` implementations with
//! fault injection, for tests and local smoke runs.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use feed_core::{
    FeedError, FeedErrorKind, Message, MessageId, MessageRepository, OutgoingMessage, PushChannel,
    PushEvent, PushFrame, PushSubscription, Scope,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const SUBSCRIBER_BUFFER: usize = 256;
const CLOCK_ORIGIN_MS: u64 = 1_731_000_000_000;

fn poisoned() -> FeedError {
    FeedError::new(FeedErrorKind::Internal, "poisoned_lock", "poisoned lock")
}

struct Subscriber {
    tx: mpsc::Sender<PushFrame>,
    unsubscribed: CancellationToken,
}

#[derive(Default)]
struct HubState {
    offline: bool,
    subscribers: HashMap<Scope, Vec<Subscriber>>,
    subscribe_calls: usize,
}

/// Fan-out push transport. Events published while a scope has no live
/// subscriber (or while offline) are lost, like a real realtime channel.
#[derive(Clone, Default)]
pub struct InMemoryPushHub {
    state: Arc<RwLock<HubState>>,
}

impl InMemoryPushHub {
    /// Publish an insert event for `message`.
    pub fn publish(&self, scope: &Scope, message: &Message) -> Result<usize, FeedError> {
        let event = PushEvent::Insert {
            message: message.clone(),
        };
        let raw = serde_json::to_value(&event).map_err(|err| {
            FeedError::new(FeedErrorKind::Internal, "encode_failed", err.to_string())
        })?;
        self.publish_raw(scope, raw)
    }

    /// Publish an arbitrary payload, returning how many subscribers got it.
    pub fn publish_raw(&self, scope: &Scope, raw: serde_json::Value) -> Result<usize, FeedError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.offline {
            trace!(%scope, "hub offline, event lost");
            return Ok(0);
        }
        let Some(subscribers) = state.subscribers.get_mut(scope) else {
            return Ok(0);
        };
        subscribers.retain(|sub| !sub.unsubscribed.is_cancelled() && !sub.tx.is_closed());
        let mut delivered = 0;
        for sub in subscribers.iter() {
            if sub.tx.try_send(PushFrame::Event(raw.clone())).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Drop every subscription of `scope` with a `TransportLost` frame.
    pub fn drop_connections(&self, scope: &Scope) -> Result<usize, FeedError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let dropped = state.subscribers.remove(scope).unwrap_or_default();
        Ok(notify_lost(dropped, "connection dropped"))
    }

    /// While offline, subscribes fail and published events are lost.
    /// Going offline drops every current subscription.
    pub fn set_offline(&self, offline: bool) -> Result<(), FeedError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.offline = offline;
        if offline {
            let dropped: Vec<Subscriber> = state
                .subscribers
                .drain()
                .flat_map(|(_, subs)| subs)
                .collect();
            notify_lost(dropped, "network offline");
        }
        Ok(())
    }

    pub fn subscriber_count(&self, scope: &Scope) -> Result<usize, FeedError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.subscribers.get(scope).map_or(0, |subs| {
            subs.iter()
                .filter(|sub| !sub.unsubscribed.is_cancelled())
                .count()
        }))
    }

    pub fn subscribe_calls(&self) -> Result<usize, FeedError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.subscribe_calls)
    }
}

fn notify_lost(dropped: Vec<Subscriber>, reason: &str) -> usize {
    let count = dropped.len();
    for sub in dropped {
        let _ = sub.tx.try_send(PushFrame::TransportLost {
            reason: reason.to_owned(),
        });
    }
    count
}

#[async_trait]
impl PushChannel for InMemoryPushHub {
    async fn subscribe(&self, scope: &Scope) -> Result<PushSubscription, FeedError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.subscribe_calls += 1;
        if state.offline {
            return Err(FeedError::transport("subscribe_failed", "network offline"));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let unsubscribed = CancellationToken::new();
        state
            .subscribers
            .entry(scope.clone())
            .or_default()
            .push(Subscriber {
                tx,
                unsubscribed: unsubscribed.clone(),
            });
        debug!(%scope, "in-memory subscription opened");
        Ok(PushSubscription::new(rx, unsubscribed))
    }
}

#[derive(Default)]
struct RepoState {
    logs: HashMap<Scope, Vec<Message>>,
    next_id: u64,
    fail_fetches: usize,
    fail_inserts: usize,
    suppress_echoes: bool,
    fetch_delay: Option<Duration>,
    snapshot_at_request: bool,
}

impl RepoState {
    fn append(&mut self, scope: &Scope, draft: &OutgoingMessage) -> Message {
        self.next_id += 1;
        let message = Message {
            id: MessageId(self.next_id),
            author_handle: draft.author_handle.clone(),
            body: draft.body.clone(),
            origin_tag: draft.origin_tag,
            created_at_ms: CLOCK_ORIGIN_MS + self.next_id * 1_000,
        };
        self.logs
            .entry(scope.clone())
            .or_default()
            .push(message.clone());
        message
    }

    fn page(&self, scope: &Scope, cursor: Option<MessageId>, limit: u16) -> Vec<Message> {
        let log = self.logs.get(scope).map(Vec::as_slice).unwrap_or_default();
        let end = match cursor {
            Some(cursor) => log.partition_point(|message| message.id < cursor),
            None => log.len(),
        };
        let start = end.saturating_sub(usize::from(limit));
        log[start..end].to_vec()
    }
}

/// Per-scope message log with repository-assigned increasing ids.
///
/// When built with a push hub, every successful insert is echoed through it.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<RepoState>>,
    push: Option<InMemoryPushHub>,
    fetch_calls: Arc<AtomicUsize>,
    insert_calls: Arc<AtomicUsize>,
}

impl InMemoryRepository {
    pub fn with_push(push: InMemoryPushHub) -> Self {
        Self {
            push: Some(push),
            ..Self::default()
        }
    }

    /// Append history without echoing it.
    pub fn seed(
        &self,
        scope: &Scope,
        drafts: impl IntoIterator<Item = OutgoingMessage>,
    ) -> Result<Vec<Message>, FeedError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        Ok(drafts
            .into_iter()
            .map(|draft| state.append(scope, &draft))
            .collect())
    }

    /// Every stored message of `scope`, ascending.
    pub fn all(&self, scope: &Scope) -> Result<Vec<Message>, FeedError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.logs.get(scope).cloned().unwrap_or_default())
    }

    pub fn fail_next_fetches(&self, count: usize) -> Result<(), FeedError> {
        self.state.write().map_err(|_| poisoned())?.fail_fetches = count;
        Ok(())
    }

    pub fn fail_next_inserts(&self, count: usize) -> Result<(), FeedError> {
        self.state.write().map_err(|_| poisoned())?.fail_inserts = count;
        Ok(())
    }

    /// Stop echoing inserts through the push hub.
    pub fn suppress_echoes(&self, suppress: bool) -> Result<(), FeedError> {
        self.state.write().map_err(|_| poisoned())?.suppress_echoes = suppress;
        Ok(())
    }

    /// Delay every fetch, to hold requests in flight.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) -> Result<(), FeedError> {
        self.state.write().map_err(|_| poisoned())?.fetch_delay = delay;
        Ok(())
    }

    /// Read the page when the request arrives instead of after the delay.
    pub fn snapshot_at_request(&self, enabled: bool) -> Result<(), FeedError> {
        self.state.write().map_err(|_| poisoned())?.snapshot_at_request = enabled;
        Ok(())
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageRepository for InMemoryRepository {
    async fn fetch_page(
        &self,
        scope: &Scope,
        cursor: Option<MessageId>,
        limit: u16,
    ) -> Result<Vec<Message>, FeedError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, snapshot) = {
            let state = self.state.read().map_err(|_| poisoned())?;
            let snapshot = state
                .snapshot_at_request
                .then(|| state.page(scope, cursor, limit));
            (state.fetch_delay, snapshot)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(FeedError::fetch("injected fetch failure"));
        }
        Ok(snapshot.unwrap_or_else(|| state.page(scope, cursor, limit)))
    }

    async fn insert(&self, scope: &Scope, draft: &OutgoingMessage) -> Result<Message, FeedError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let (message, echo) = {
            let mut state = self.state.write().map_err(|_| poisoned())?;
            if state.fail_inserts > 0 {
                state.fail_inserts -= 1;
                return Err(FeedError::write("injected write failure"));
            }
            (state.append(scope, draft), !state.suppress_echoes)
        };

        if echo && let Some(push) = &self.push {
            push.publish(scope, &message)?;
        }
        Ok(message)
    }
}
