use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use feed_core::{FeedError, FeedErrorKind, MessageId, MessageRepository, Page, Scope};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Upper bound applied to any configured page size.
pub const MAX_PAGE_SIZE: u16 = 100;

type PageFuture = Shared<BoxFuture<'static, Result<Page, FeedError>>>;
type Slot = Arc<Mutex<Option<InFlight>>>;

struct InFlight {
    ticket: u64,
    fetch: PageFuture,
}

/// Cursor-based history loader with request coalescing.
///
/// While a fetch is in flight, further calls on the same path await that
/// fetch instead of issuing another one. The older-page and latest-page
/// paths coalesce independently. [`PaginationLoader::refresh_latest_page`]
/// never joins: its snapshot must postdate the call.
pub struct PaginationLoader {
    repo: Arc<dyn MessageRepository>,
    scope: Scope,
    page_size: u16,
    cancel: CancellationToken,
    older: Slot,
    latest: Slot,
    tickets: AtomicU64,
}

impl PaginationLoader {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        scope: Scope,
        page_size: u16,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            scope,
            page_size: bounded_page_size(page_size),
            cancel,
            older: Arc::default(),
            latest: Arc::default(),
            tickets: AtomicU64::new(0),
        }
    }

    /// Fetch the page below `cursor` (the store's oldest id), or the latest
    /// page when the store is empty.
    pub async fn load_older_page(&self, cursor: Option<MessageId>) -> Result<Page, FeedError> {
        self.join_or_start(&self.older, cursor)?.await
    }

    /// Fetch the latest page ("latest N"), used for the first load.
    pub async fn load_latest_page(&self) -> Result<Page, FeedError> {
        self.join_or_start(&self.latest, None)?.await
    }

    /// Fetch the latest page with a request issued now. Supersedes any
    /// latest fetch in flight; later `load_latest_page` calls join this one.
    pub async fn refresh_latest_page(&self) -> Result<Page, FeedError> {
        let fetch = {
            let mut guard = self.lock(&self.latest)?;
            self.start(&mut guard, &self.latest, None)
        };
        fetch.await
    }

    pub fn is_loading_older(&self) -> bool {
        self.older.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn lock<'a>(&self, slot: &'a Slot) -> Result<MutexGuard<'a, Option<InFlight>>, FeedError> {
        slot.lock().map_err(|_| {
            FeedError::new(FeedErrorKind::Internal, "poisoned_lock", "pagination slot poisoned")
        })
    }

    fn join_or_start(
        &self,
        slot: &Slot,
        cursor: Option<MessageId>,
    ) -> Result<PageFuture, FeedError> {
        let mut guard = self.lock(slot)?;
        if let Some(in_flight) = guard.as_ref() {
            trace!(scope = %self.scope, ticket = in_flight.ticket, "joining in-flight page fetch");
            return Ok(in_flight.fetch.clone());
        }
        Ok(self.start(&mut guard, slot, cursor))
    }

    /// Install a new fetch in `slot`. It only clears the slot on completion
    /// if nothing has replaced it since.
    fn start(
        &self,
        guard: &mut Option<InFlight>,
        slot: &Slot,
        cursor: Option<MessageId>,
    ) -> PageFuture {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let repo = Arc::clone(&self.repo);
        let scope = self.scope.clone();
        let limit = self.page_size;
        let cancel = self.cancel.clone();
        let release = Arc::clone(slot);
        debug!(%scope, cursor = ?cursor, limit, ticket, "starting page fetch");

        let fetch = async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(FeedError::cancelled("page fetch")),
                fetched = repo.fetch_page(&scope, cursor, limit) => fetched
                    .map(|messages| {
                        let exhausted = messages.len() < usize::from(limit);
                        Page { messages, exhausted }
                    })
                    .map_err(as_fetch_error),
            };
            if let Ok(mut slot) = release.lock()
                && slot.as_ref().is_some_and(|in_flight| in_flight.ticket == ticket)
            {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared();

        *guard = Some(InFlight {
            ticket,
            fetch: fetch.clone(),
        });
        fetch
    }
}

/// Clamp a page size into `1..=MAX_PAGE_SIZE`.
pub fn bounded_page_size(requested: u16) -> u16 {
    requested.clamp(1, MAX_PAGE_SIZE)
}

fn as_fetch_error(err: FeedError) -> FeedError {
    if matches!(err.kind, FeedErrorKind::Fetch | FeedErrorKind::Cancelled) {
        return err;
    }
    FeedError {
        kind: FeedErrorKind::Fetch,
        ..err
    }
}
