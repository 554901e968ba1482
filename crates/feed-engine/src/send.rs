use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use feed_core::{
    FeedError, FeedErrorKind, Message, MessageRepository, MessageStore, OutgoingMessage,
    PendingMessage, PendingStatus, Scope, find_echo,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    now_ms,
    signal::{Signal, SignalSink},
};

/// Optimistic send pipeline for one scope.
///
/// Each `send` issues exactly one repository write. Failed entries stay
/// visible until the user retries or discards them.
pub(crate) struct SendCoordinator {
    repo: Arc<dyn MessageRepository>,
    scope: Scope,
    echo_timeout: Duration,
    cancel: CancellationToken,
    sink: SignalSink,
    pending: Vec<PendingMessage>,
    writes_in_flight: HashSet<String>,
    awaiting_echo: HashMap<String, Message>,
}

impl SendCoordinator {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        scope: Scope,
        echo_timeout: Duration,
        cancel: CancellationToken,
        sink: SignalSink,
    ) -> Self {
        Self {
            repo,
            scope,
            echo_timeout,
            cancel,
            sink,
            pending: Vec::new(),
            writes_in_flight: HashSet::new(),
            awaiting_echo: HashMap::new(),
        }
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    /// Insert a `Sending` entry and submit its write. Returns the temp key.
    pub fn send(&mut self, draft: OutgoingMessage) -> String {
        let temp_key = format!("tmp-{}", Uuid::new_v4());
        self.pending
            .push(PendingMessage::sending(temp_key.clone(), &draft, now_ms()));
        debug!(scope = %self.scope, %temp_key, "optimistic send queued");
        self.submit(temp_key.clone(), draft);
        temp_key
    }

    /// Resubmit a failed entry as a new, user-initiated write.
    pub fn retry(&mut self, temp_key: &str) -> Result<(), FeedError> {
        let index = self.index_of(temp_key)?;
        let entry = &mut self.pending[index];
        if entry.status != PendingStatus::Failed || self.writes_in_flight.contains(temp_key) {
            return Err(not_retryable(temp_key, entry.status));
        }
        entry.status = PendingStatus::Sending;
        entry.error = None;
        entry.submitted_at_ms = now_ms();
        let draft = entry.to_outgoing();
        debug!(scope = %self.scope, %temp_key, "retrying failed send");
        self.submit(temp_key.to_owned(), draft);
        Ok(())
    }

    /// Remove a failed entry.
    pub fn discard(&mut self, temp_key: &str) -> Result<PendingMessage, FeedError> {
        let index = self.index_of(temp_key)?;
        let status = self.pending[index].status;
        if status != PendingStatus::Failed {
            return Err(not_retryable(temp_key, status));
        }
        Ok(self.pending.remove(index))
    }

    /// Apply a write result. Returns a message to merge right away, if any.
    pub fn on_write_finished(
        &mut self,
        temp_key: &str,
        result: Result<Message, FeedError>,
        store: &MessageStore,
    ) -> Option<Message> {
        self.writes_in_flight.remove(temp_key);
        let index = self.index_of(temp_key).ok();

        match result {
            Ok(message) => {
                let Some(index) = index else {
                    // Already reconciled against a look-alike; make sure the
                    // written message itself lands.
                    return Some(message);
                };
                if store.contains(message.id) {
                    self.pending.remove(index);
                    return None;
                }
                let entry = &mut self.pending[index];
                entry.status = PendingStatus::Confirmed;
                entry.confirmed_id = Some(message.id);
                debug!(scope = %self.scope, %temp_key, id = %message.id, "write confirmed, awaiting echo");
                self.awaiting_echo.insert(temp_key.to_owned(), message);
                self.arm_echo_timer(temp_key.to_owned());
                None
            }
            Err(err) if err.is_cancelled() => None,
            Err(err) => {
                warn!(scope = %self.scope, %temp_key, code = %err.code, "send failed");
                if let Some(index) = index {
                    let entry = &mut self.pending[index];
                    entry.status = PendingStatus::Failed;
                    entry.error = Some(err);
                }
                None
            }
        }
    }

    /// Echo wait expired: the write result becomes authoritative.
    pub fn on_echo_deadline(&mut self, temp_key: &str) -> Option<Message> {
        let message = self.awaiting_echo.remove(temp_key)?;
        if let Ok(index) = self.index_of(temp_key) {
            self.pending.remove(index);
        }
        debug!(scope = %self.scope, %temp_key, id = %message.id, "no echo before timeout, merging write result");
        Some(message)
    }

    /// Drop pending entries whose confirmed counterpart was just merged.
    pub fn reconcile<'a>(&mut self, merged: impl IntoIterator<Item = &'a Message>) -> usize {
        self.reconcile_with(merged, find_echo)
    }

    /// Id-only reconciliation, for merges that may carry look-alikes
    /// written by someone else.
    pub fn reconcile_confirmed<'a>(
        &mut self,
        merged: impl IntoIterator<Item = &'a Message>,
    ) -> usize {
        self.reconcile_with(merged, |pending, message| {
            pending
                .iter()
                .position(|entry| entry.confirmed_id == Some(message.id))
        })
    }

    fn reconcile_with<'a>(
        &mut self,
        merged: impl IntoIterator<Item = &'a Message>,
        matches: impl Fn(&[PendingMessage], &Message) -> Option<usize>,
    ) -> usize {
        let mut removed = 0;
        for message in merged {
            if let Some(index) = matches(&self.pending, message) {
                let entry = self.pending.remove(index);
                self.awaiting_echo.remove(&entry.temp_key);
                debug!(scope = %self.scope, temp_key = %entry.temp_key, id = %message.id, "pending send reconciled");
                removed += 1;
            }
        }
        removed
    }

    fn submit(&mut self, temp_key: String, draft: OutgoingMessage) {
        self.writes_in_flight.insert(temp_key.clone());
        let repo = Arc::clone(&self.repo);
        let scope = self.scope.clone();
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                written = repo.insert(&scope, &draft) => written.map_err(as_write_error),
            };
            sink.emit(Signal::WriteFinished { temp_key, result }).await;
        });
    }

    fn arm_echo_timer(&self, temp_key: String) {
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let echo_timeout = self.echo_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(echo_timeout) => {
                    sink.emit(Signal::EchoDeadline { temp_key }).await;
                }
            }
        });
    }

    fn index_of(&self, temp_key: &str) -> Result<usize, FeedError> {
        self.pending
            .iter()
            .position(|entry| entry.temp_key == temp_key)
            .ok_or_else(|| {
                FeedError::new(
                    FeedErrorKind::Config,
                    "pending_not_found",
                    format!("no pending send with key '{temp_key}'"),
                )
            })
    }
}

fn not_retryable(temp_key: &str, status: PendingStatus) -> FeedError {
    FeedError::new(
        FeedErrorKind::Config,
        "pending_not_retryable",
        format!("pending send '{temp_key}' is {status:?}, not failed"),
    )
}

fn as_write_error(err: FeedError) -> FeedError {
    if err.kind == FeedErrorKind::Write {
        return err;
    }
    FeedError {
        kind: FeedErrorKind::Write,
        ..err
    }
}

#[cfg(test)]
mod tests {
    use feed_core::{MessageId, OriginTag};
    use feed_memory::InMemoryRepository;
    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::signal::Envelope;

    struct Harness {
        repo: InMemoryRepository,
        coordinator: SendCoordinator,
        cancel: CancellationToken,
        rx: mpsc::Receiver<Envelope>,
    }

    fn harness() -> Harness {
        let repo = InMemoryRepository::default();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let coordinator = SendCoordinator::new(
            Arc::new(repo.clone()),
            Scope::Global,
            Duration::from_secs(5),
            cancel.clone(),
            SignalSink::new(1, tx),
        );
        Harness {
            repo,
            coordinator,
            cancel,
            rx,
        }
    }

    fn draft(body: &str) -> OutgoingMessage {
        OutgoingMessage::new(body, "alice", OriginTag::Authenticated)
    }

    async fn next_signal(rx: &mut mpsc::Receiver<Envelope>) -> Signal {
        timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("signal timeout")
            .expect("signal receive")
            .signal
    }

    async fn write_result(
        rx: &mut mpsc::Receiver<Envelope>,
    ) -> (String, Result<Message, FeedError>) {
        match next_signal(rx).await {
            Signal::WriteFinished { temp_key, result } => (temp_key, result),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_write_waits_for_echo_then_times_out() {
        let mut h = harness();
        let store = MessageStore::default();
        let key = h.coordinator.send(draft("hi"));
        assert_eq!(h.coordinator.pending()[0].status, PendingStatus::Sending);

        let (temp_key, result) = write_result(&mut h.rx).await;
        assert_eq!(temp_key, key);
        assert!(h.coordinator.on_write_finished(&temp_key, result, &store).is_none());
        assert_eq!(h.coordinator.pending()[0].status, PendingStatus::Confirmed);
        assert_eq!(h.coordinator.pending()[0].confirmed_id, Some(MessageId(1)));

        match next_signal(&mut h.rx).await {
            Signal::EchoDeadline { temp_key } => {
                let message = h
                    .coordinator
                    .on_echo_deadline(&temp_key)
                    .expect("write result becomes authoritative");
                assert_eq!(message.body, "hi");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        assert!(h.coordinator.pending().is_empty());
        assert_eq!(h.repo.insert_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_before_timeout_clears_pending_and_disarms_fallback() {
        let mut h = harness();
        let mut store = MessageStore::default();
        h.coordinator.send(draft("hi"));

        let (temp_key, result) = write_result(&mut h.rx).await;
        let written = result.clone().expect("write ok");
        h.coordinator.on_write_finished(&temp_key, result, &store);

        store.merge_one(written.clone());
        assert_eq!(h.coordinator.reconcile([&written]), 1);
        assert!(h.coordinator.pending().is_empty());

        match next_signal(&mut h.rx).await {
            Signal::EchoDeadline { temp_key } => {
                assert!(h.coordinator.on_echo_deadline(&temp_key).is_none());
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_racing_ahead_of_write_result_is_not_duplicated() {
        let mut h = harness();
        let mut store = MessageStore::default();
        h.coordinator.send(draft("hi"));
        let (temp_key, result) = write_result(&mut h.rx).await;
        let written = result.clone().expect("write ok");

        store.merge_one(written.clone());
        assert_eq!(h.coordinator.reconcile([&written]), 1);

        let late = h.coordinator.on_write_finished(&temp_key, result, &store);
        assert_eq!(late.as_ref().map(|m| m.id), Some(written.id));
        assert!(store.merge(late).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn history_merge_clears_only_the_confirmed_id() {
        let mut h = harness();
        let store = MessageStore::default();
        h.coordinator.send(draft("hi"));
        let (temp_key, result) = write_result(&mut h.rx).await;
        let written = result.clone().expect("write ok");
        h.coordinator.on_write_finished(&temp_key, result, &store);
        h.coordinator.send(draft("hi"));

        let look_alike = Message {
            id: MessageId(40),
            ..written.clone()
        };
        assert_eq!(h.coordinator.reconcile_confirmed([&look_alike]), 0);
        assert_eq!(h.coordinator.reconcile_confirmed([&written]), 1);

        let remaining = h.coordinator.pending();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, PendingStatus::Sending);
        assert!(h.coordinator.on_echo_deadline(&temp_key).is_none());
    }

    #[tokio::test]
    async fn failed_write_stays_visible_and_is_not_retried() {
        let mut h = harness();
        let store = MessageStore::default();
        h.repo.fail_next_inserts(1).expect("inject");
        let key = h.coordinator.send(draft("hi"));

        let (temp_key, result) = write_result(&mut h.rx).await;
        assert!(h.coordinator.on_write_finished(&temp_key, result, &store).is_none());

        let entry = &h.coordinator.pending()[0];
        assert_eq!(entry.temp_key, key);
        assert_eq!(entry.status, PendingStatus::Failed);
        assert_eq!(entry.body, "hi");
        assert_eq!(
            entry.error.as_ref().map(|err| err.kind),
            Some(FeedErrorKind::Write)
        );

        tokio::task::yield_now().await;
        assert_eq!(h.repo.insert_calls(), 1);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_resubmits_once_and_discard_requires_failure() {
        let mut h = harness();
        let store = MessageStore::default();
        h.repo.fail_next_inserts(1).expect("inject");
        let key = h.coordinator.send(draft("hi"));
        let (temp_key, result) = write_result(&mut h.rx).await;
        h.coordinator.on_write_finished(&temp_key, result, &store);

        h.coordinator.retry(&key).expect("retry failed entry");
        let err = h
            .coordinator
            .retry(&key)
            .expect_err("second retry while sending must fail");
        assert_eq!(err.code, "pending_not_retryable");
        let err = h
            .coordinator
            .discard(&key)
            .expect_err("cannot discard while sending");
        assert_eq!(err.code, "pending_not_retryable");

        let (_, result) = write_result(&mut h.rx).await;
        assert!(result.is_ok());
        assert_eq!(h.repo.insert_calls(), 2);
    }

    #[tokio::test]
    async fn discards_failed_entry() {
        let mut h = harness();
        let store = MessageStore::default();
        h.repo.fail_next_inserts(1).expect("inject");
        let key = h.coordinator.send(draft("hi"));
        let (temp_key, result) = write_result(&mut h.rx).await;
        h.coordinator.on_write_finished(&temp_key, result, &store);

        let removed = h.coordinator.discard(&key).expect("discard failed entry");
        assert_eq!(removed.body, "hi");
        assert!(h.coordinator.pending().is_empty());

        let err = h.coordinator.discard(&key).expect_err("unknown key");
        assert_eq!(err.code, "pending_not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_echo_timer() {
        let mut h = harness();
        let store = MessageStore::default();
        h.coordinator.send(draft("hi"));
        let (temp_key, result) = write_result(&mut h.rx).await;
        h.coordinator.on_write_finished(&temp_key, result, &store);

        h.cancel.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.rx.try_recv().is_err());
    }
}
