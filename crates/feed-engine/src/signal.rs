use feed_core::{ConnectionStatus, FeedError, Message, Page};
use tokio::sync::mpsc;

/// Output of the live channel task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LiveSignal {
    Status(ConnectionStatus),
    Insert(Message),
    /// Entered `Live`; events missed before this point must be re-fetched.
    BackfillNeeded { reconnect: bool },
}

/// Which path produced a page result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    /// First "latest N" page of a scope.
    Initial,
    /// Page strictly older than the store's oldest id.
    Older,
    /// "Latest N" page re-fetched after entering `Live`.
    Backfill,
}

#[derive(Debug)]
pub(crate) enum Signal {
    Live(LiveSignal),
    PageLoaded {
        kind: PageKind,
        result: Result<Page, FeedError>,
    },
    WriteFinished {
        temp_key: String,
        result: Result<Message, FeedError>,
    },
    EchoDeadline {
        temp_key: String,
    },
}

/// Signal tagged with the scope generation that produced it.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub generation: u64,
    pub signal: Signal,
}

/// Sender side handed to every task spawned for one scope.
#[derive(Debug, Clone)]
pub(crate) struct SignalSink {
    generation: u64,
    tx: mpsc::Sender<Envelope>,
}

impl SignalSink {
    pub fn new(generation: u64, tx: mpsc::Sender<Envelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the controller is gone.
    pub async fn emit(&self, signal: Signal) -> bool {
        self.tx
            .send(Envelope {
                generation: self.generation,
                signal,
            })
            .await
            .is_ok()
    }
}
