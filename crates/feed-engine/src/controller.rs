use std::sync::Arc;

use feed_core::{
    ConnectionStatus, FeedChannelError, FeedChannels, FeedCommand, FeedError, FeedErrorKind,
    FeedState, MergeOrigin, MergeResult, Message, MessageRepository, MessageStore,
    OutgoingMessage, Page, PushChannel, Scope, ScrollAnchor, StatePublisher, StateStream,
    ViewportAction, ViewportGeometry,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::FeedConfig,
    live::{LiveChannelHandle, spawn_live_channel},
    loader::PaginationLoader,
    send::SendCoordinator,
    signal::{Envelope, LiveSignal, PageKind, Signal, SignalSink},
};

const SIGNAL_BUFFER: usize = 256;

/// Presentation-side handle to a running feed.
///
/// Dropping every clone shuts the runtime down.
#[derive(Clone, Debug)]
pub struct FeedHandle {
    channels: FeedChannels,
}

impl FeedHandle {
    pub async fn send(&self, command: FeedCommand) -> Result<(), FeedChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> StateStream {
        self.channels.subscribe()
    }

    pub async fn send_message(&self, draft: OutgoingMessage) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::SendMessage { draft }).await
    }

    pub async fn request_older_page(&self) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::RequestOlderPage).await
    }

    pub async fn report_viewport(
        &self,
        at_top: bool,
        at_bottom: bool,
    ) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::ViewportEdges { at_top, at_bottom }).await
    }

    pub async fn report_scroll(&self, geometry: ViewportGeometry) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::ViewportScrolled(geometry)).await
    }

    pub async fn retry_send(&self, temp_key: impl Into<String>) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::RetrySend {
            temp_key: temp_key.into(),
        })
        .await
    }

    pub async fn discard_send(&self, temp_key: impl Into<String>) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::DiscardSend {
            temp_key: temp_key.into(),
        })
        .await
    }

    pub async fn switch_scope(&self, scope: Scope) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::SwitchScope { scope }).await
    }

    pub async fn shutdown(&self) -> Result<(), FeedChannelError> {
        self.send(FeedCommand::Shutdown).await
    }
}

/// Composition root for one feed surface.
///
/// Runs as a single task: commands and task signals are dispatched one at a
/// time, and at most one `FeedState` is published per dispatch.
pub struct FeedController {
    config: FeedConfig,
    repo: Arc<dyn MessageRepository>,
    push: Arc<dyn PushChannel>,
    publisher: StatePublisher,
    command_rx: mpsc::Receiver<FeedCommand>,
    signal_tx: mpsc::Sender<Envelope>,
    signal_rx: mpsc::Receiver<Envelope>,
    generation: u64,
    session: ScopeSession,
    last_published: Option<FeedState>,
}

impl FeedController {
    /// Start a feed runtime for `scope` and return its handle.
    pub fn spawn(
        config: FeedConfig,
        repo: Arc<dyn MessageRepository>,
        push: Arc<dyn PushChannel>,
        scope: Scope,
    ) -> FeedHandle {
        let (channels, command_rx) = FeedChannels::new(config.command_buffer, config.state_buffer);
        let publisher = channels.state_publisher();
        tokio::spawn(async move {
            let controller = FeedController::new(config, repo, push, publisher, command_rx, scope);
            controller.run().await;
        });

        FeedHandle { channels }
    }

    fn new(
        config: FeedConfig,
        repo: Arc<dyn MessageRepository>,
        push: Arc<dyn PushChannel>,
        publisher: StatePublisher,
        command_rx: mpsc::Receiver<FeedCommand>,
        scope: Scope,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let generation = 1;
        let session = ScopeSession::open(
            &config,
            Arc::clone(&repo),
            Arc::clone(&push),
            scope,
            SignalSink::new(generation, signal_tx.clone()),
        );

        Self {
            config,
            repo,
            push,
            publisher,
            command_rx,
            signal_tx,
            signal_rx,
            generation,
            session,
            last_published: None,
        }
    }

    async fn run(mut self) {
        self.publish_if_changed();

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    None | Some(FeedCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                Some(envelope) = self.signal_rx.recv() => {
                    if envelope.generation != self.generation {
                        trace!(
                            generation = envelope.generation,
                            current = self.generation,
                            "discarding stale signal"
                        );
                        continue;
                    }
                    self.session.handle_signal(envelope.signal);
                }
            }
            self.publish_if_changed();
        }

        self.shutdown().await;
    }

    fn handle_command(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::SwitchScope { scope } => self.switch_scope(scope),
            FeedCommand::Shutdown => {}
            other => self.session.handle_command(other),
        }
    }

    fn switch_scope(&mut self, scope: Scope) {
        if scope == self.session.scope {
            debug!(%scope, "scope already open");
            return;
        }

        info!(from = %self.session.scope, to = %scope, "switching feed scope");
        self.session.teardown();
        self.generation += 1;
        self.session = ScopeSession::open(
            &self.config,
            Arc::clone(&self.repo),
            Arc::clone(&self.push),
            scope,
            SignalSink::new(self.generation, self.signal_tx.clone()),
        );
    }

    async fn shutdown(mut self) {
        info!(scope = %self.session.scope, "feed controller shutting down");
        // Closing first lets tasks blocked on a full signal queue exit.
        self.signal_rx.close();
        if let Some(live) = self.session.teardown() {
            live.stop_and_join().await;
        }
        self.session.connection = ConnectionStatus::Disconnected;
        self.publish_if_changed();
    }

    fn publish_if_changed(&mut self) {
        let state = self.session.snapshot();
        if self.last_published.as_ref() == Some(&state) {
            return;
        }
        self.publisher.publish(state.clone());
        self.last_published = Some(state);
    }
}

/// Everything owned by one open scope. Dropped wholesale on scope switch.
struct ScopeSession {
    scope: Scope,
    cancel: CancellationToken,
    sink: SignalSink,
    store: MessageStore,
    anchor: ScrollAnchor,
    loader: Arc<PaginationLoader>,
    sender: SendCoordinator,
    live: Option<LiveChannelHandle>,
    connection: ConnectionStatus,
    has_more_history: bool,
    initial_loaded: bool,
    backfill_pending: bool,
    last_error: Option<FeedError>,
}

impl ScopeSession {
    fn open(
        config: &FeedConfig,
        repo: Arc<dyn MessageRepository>,
        push: Arc<dyn PushChannel>,
        scope: Scope,
        sink: SignalSink,
    ) -> Self {
        info!(%scope, generation = sink.generation(), "opening feed scope");
        let cancel = CancellationToken::new();

        let mut anchor = ScrollAnchor::new(config.top_threshold_px, config.bottom_threshold_px);
        if let Some(local_author) = &config.local_author {
            anchor.add_local_author(local_author.clone());
        }

        let loader = Arc::new(PaginationLoader::new(
            Arc::clone(&repo),
            scope.clone(),
            config.page_size,
            cancel.child_token(),
        ));
        let sender = SendCoordinator::new(
            repo,
            scope.clone(),
            config.echo_timeout(),
            cancel.child_token(),
            sink.clone(),
        );
        let live = spawn_live_channel(
            push,
            scope.clone(),
            config.retry_policy(),
            cancel.child_token(),
            sink.clone(),
        );

        let session = Self {
            scope,
            cancel,
            sink,
            store: MessageStore::new(config.max_retained),
            anchor,
            loader,
            sender,
            live: Some(live),
            connection: ConnectionStatus::Connecting,
            has_more_history: true,
            initial_loaded: false,
            backfill_pending: false,
            last_error: None,
        };
        session.spawn_page_load(PageKind::Initial);
        session
    }

    /// Cancel every task of this scope. Returns the live handle for joining.
    fn teardown(&mut self) -> Option<LiveChannelHandle> {
        debug!(scope = %self.scope, "tearing down feed scope");
        self.cancel.cancel();
        let live = self.live.take();
        if let Some(live) = &live {
            live.stop();
        }
        live
    }

    fn handle_command(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::SendMessage { draft } => {
                self.anchor.add_local_author(draft.author_handle.clone());
                self.sender.send(draft);
            }
            FeedCommand::RequestOlderPage => {
                if self.backfill_pending {
                    self.backfill_pending = false;
                    self.spawn_page_load(PageKind::Backfill);
                }
                if self.anchor.is_loading_older() {
                    trace!(scope = %self.scope, "older page already loading");
                    return;
                }
                self.anchor.mark_loading_older();
                self.start_older_load();
            }
            FeedCommand::ViewportEdges { at_top, at_bottom } => {
                let action = self.anchor.observe_edges(at_top, at_bottom);
                self.apply_viewport_action(action);
            }
            FeedCommand::ViewportScrolled(geometry) => {
                let action = self.anchor.observe_geometry(geometry);
                self.apply_viewport_action(action);
            }
            FeedCommand::RetrySend { temp_key } => {
                if let Err(err) = self.sender.retry(&temp_key) {
                    self.surface_command_error(err);
                }
            }
            FeedCommand::DiscardSend { temp_key } => match self.sender.discard(&temp_key) {
                Ok(_) => debug!(scope = %self.scope, %temp_key, "discarded failed send"),
                Err(err) => self.surface_command_error(err),
            },
            FeedCommand::SwitchScope { .. } | FeedCommand::Shutdown => {}
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Live(LiveSignal::Status(status)) => {
                if status != self.connection {
                    debug!(scope = %self.scope, ?status, "connection status changed");
                }
                self.connection = status;
            }
            Signal::Live(LiveSignal::Insert(message)) => {
                self.merge_into(vec![message], MergeOrigin::Live);
            }
            Signal::Live(LiveSignal::BackfillNeeded { reconnect }) => {
                debug!(scope = %self.scope, reconnect, "requesting backfill");
                self.backfill_pending = false;
                self.spawn_page_load(PageKind::Backfill);
            }
            Signal::PageLoaded { kind, result } => self.on_page_loaded(kind, result),
            Signal::WriteFinished { temp_key, result } => {
                if let Some(message) = self.sender.on_write_finished(&temp_key, result, &self.store)
                {
                    self.merge_into(vec![message], MergeOrigin::OwnWrite);
                }
            }
            Signal::EchoDeadline { temp_key } => {
                if let Some(message) = self.sender.on_echo_deadline(&temp_key) {
                    self.merge_into(vec![message], MergeOrigin::OwnWrite);
                }
            }
        }
    }

    fn apply_viewport_action(&mut self, action: ViewportAction) {
        if action.caught_up {
            trace!(scope = %self.scope, "viewport caught up");
            self.enforce_retention();
        }
        if action.request_older {
            self.start_older_load();
        }
    }

    /// Expects the anchor to already be marked as loading.
    fn start_older_load(&mut self) {
        if self.initial_loaded && !self.has_more_history {
            trace!(scope = %self.scope, "history exhausted");
            self.anchor.on_older_page_settled();
            return;
        }
        self.spawn_page_load(PageKind::Older);
    }

    fn spawn_page_load(&self, kind: PageKind) {
        let loader = Arc::clone(&self.loader);
        let sink = self.sink.clone();
        let cursor = self.store.oldest_id();

        tokio::spawn(async move {
            let result = match kind {
                PageKind::Older => loader.load_older_page(cursor).await,
                PageKind::Initial => loader.load_latest_page().await,
                PageKind::Backfill => loader.refresh_latest_page().await,
            };
            sink.emit(Signal::PageLoaded { kind, result }).await;
        });
    }

    fn on_page_loaded(&mut self, kind: PageKind, result: Result<Page, FeedError>) {
        if kind == PageKind::Older {
            self.anchor.on_older_page_settled();
        }

        let page = match result {
            Ok(page) => page,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                warn!(scope = %self.scope, ?kind, code = %err.code, message = %err.message, "page fetch failed");
                if kind == PageKind::Backfill {
                    self.backfill_pending = true;
                }
                self.last_error = Some(err);
                return;
            }
        };

        if self
            .last_error
            .as_ref()
            .is_some_and(|err| err.kind == FeedErrorKind::Fetch)
        {
            self.last_error = None;
        }

        let first_page = !self.initial_loaded;
        let exhausted = page.exhausted;
        let origin = match kind {
            PageKind::Initial | PageKind::Older => MergeOrigin::History,
            PageKind::Backfill => MergeOrigin::Backfill,
        };
        let result = self.merge_into(page.messages, origin);
        debug!(
            scope = %self.scope,
            ?kind,
            added = result.added.len(),
            duplicates = result.duplicates,
            exhausted,
            "page merged"
        );

        if kind == PageKind::Older || first_page {
            self.has_more_history = !exhausted;
        }
        self.initial_loaded = true;
    }

    fn merge_into(&mut self, messages: Vec<Message>, origin: MergeOrigin) -> MergeResult {
        let result = self.store.merge(messages);
        let added = result.added.iter().filter_map(|id| self.store.get(*id));
        if origin == MergeOrigin::History {
            self.sender.reconcile_confirmed(added);
        } else {
            self.sender.reconcile(added);
        }
        self.anchor.on_merged(&result, &self.store, origin);
        if origin != MergeOrigin::History {
            self.enforce_retention();
        }
        result
    }

    fn enforce_retention(&mut self) {
        if !self.anchor.at_bottom() {
            return;
        }
        let evicted = self.store.enforce_retention();
        if evicted > 0 {
            debug!(scope = %self.scope, evicted, "retention window trimmed");
            self.has_more_history = true;
        }
    }

    fn surface_command_error(&mut self, err: FeedError) {
        warn!(scope = %self.scope, code = %err.code, message = %err.message, "feed command rejected");
        self.last_error = Some(err);
    }

    fn snapshot(&self) -> FeedState {
        FeedState {
            scope: self.scope.clone(),
            messages: self.store.messages().to_vec(),
            pending: self.sender.pending().to_vec(),
            oldest_cursor: self.store.oldest_id(),
            has_more_history: self.has_more_history,
            connection: self.connection,
            unread_count: self.anchor.unread_count(),
            loading_older: self.anchor.is_loading_older(),
            last_error: self.last_error.clone(),
        }
    }
}
