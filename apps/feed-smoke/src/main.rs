mod logging;

use std::{process::ExitCode, sync::Arc, time::Duration};

use feed_core::{
    ConnectionStatus, FeedChannelError, FeedError, FeedState, MessageRepository, OriginTag,
    OutgoingMessage, Scope, StateStream,
};
use feed_engine::{FeedConfig, FeedController};
use feed_memory::{InMemoryPushHub, InMemoryRepository};
use thiserror::Error;
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::{error, info};

const SEEDED_MESSAGES: usize = 120;
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum SmokeError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Channel(#[from] FeedChannelError),
    #[error("state stream closed before {0}")]
    StreamClosed(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match FeedConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid feed configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(state) => {
            print_feed(&state);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "smoke session failed");
            eprintln!("Smoke session failed: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Initial load, paging, send, transport drop and reconnect against the
/// in-memory collaborators.
async fn run(config: FeedConfig) -> Result<FeedState, SmokeError> {
    let scope = Scope::Global;
    let hub = InMemoryPushHub::default();
    let repo = InMemoryRepository::with_push(hub.clone());
    repo.seed(
        &scope,
        (1..=SEEDED_MESSAGES).map(|i| {
            OutgoingMessage::new(format!("history #{i}"), "bob", OriginTag::Anonymous)
        }),
    )?;

    let handle = FeedController::spawn(
        config,
        Arc::new(repo.clone()),
        Arc::new(hub.clone()),
        scope.clone(),
    );
    let mut states = handle.subscribe();

    let state = step(&mut states, "initial page", |state| {
        state.connection == ConnectionStatus::Live && !state.messages.is_empty()
    })
    .await?;
    info!(loaded = state.messages.len(), "initial page loaded");

    let before = state.messages.len();
    handle
        .report_viewport(true, false)
        .await?;
    let state = step(&mut states, "older page", |state| {
        state.messages.len() > before && !state.loading_older
    })
    .await?;
    info!(loaded = state.messages.len(), "older page loaded");

    handle
        .report_viewport(false, true)
        .await?;
    handle
        .send_message(OutgoingMessage::new(
            "hello from the smoke runner",
            "smoke",
            OriginTag::Authenticated,
        ))
        .await?;
    step(&mut states, "own message", |state| {
        state.pending.is_empty()
            && state
                .messages
                .last()
                .is_some_and(|message| message.author_handle == "smoke")
    })
    .await?;

    hub.set_offline(true)?;
    step(&mut states, "degraded", |state| {
        state.connection == ConnectionStatus::Degraded
    })
    .await?;
    let missed = repo
        .insert(
            &scope,
            &OutgoingMessage::new("sent while you were away", "bob", OriginTag::Anonymous),
        )
        .await?;
    hub.set_offline(false)?;

    let state = step(&mut states, "reconnect backfill", |state| {
        state.connection == ConnectionStatus::Live
            && state.messages.iter().any(|message| message.id == missed.id)
    })
    .await?;
    info!(id = %missed.id, "missed message recovered by backfill");

    handle.shutdown().await?;
    step(&mut states, "shutdown", |state| {
        state.connection == ConnectionStatus::Disconnected
    })
    .await?;
    Ok(state)
}

async fn step(
    states: &mut StateStream,
    what: &'static str,
    predicate: impl Fn(&FeedState) -> bool,
) -> Result<FeedState, SmokeError> {
    let wait = async {
        loop {
            match states.recv().await {
                Ok(state) if predicate(&state) => return Ok(state),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(SmokeError::StreamClosed(what)),
            }
        }
    };
    timeout(STEP_TIMEOUT, wait)
        .await
        .map_err(|_| SmokeError::Timeout(what))?
}

fn print_feed(state: &FeedState) {
    println!(
        "scope={} messages={} oldest={:?} more_history={} unread={}",
        state.scope,
        state.messages.len(),
        state.oldest_cursor.map(|id| id.get()),
        state.has_more_history,
        state.unread_count,
    );
    for message in state.messages.iter().rev().take(5).rev() {
        println!("  #{} {}: {}", message.id, message.author_handle, message.body);
    }
}
