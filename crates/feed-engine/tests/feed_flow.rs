use std::{sync::Arc, time::Duration};

use feed_core::{
    ConnectionStatus, FeedChannelError, FeedErrorKind, FeedState, MessageRepository, OriginTag,
    OutgoingMessage, PendingStatus, Scope, StateStream, ViewportGeometry,
};
use feed_engine::{FeedConfig, FeedController, FeedHandle};
use feed_memory::{InMemoryPushHub, InMemoryRepository};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Instant, timeout},
};

struct Fixture {
    repo: InMemoryRepository,
    hub: InMemoryPushHub,
    handle: FeedHandle,
    states: StateStream,
}

fn draft(author: &str, body: &str) -> OutgoingMessage {
    OutgoingMessage::new(body, author, OriginTag::Anonymous)
}

fn config(page_size: u16) -> FeedConfig {
    FeedConfig {
        page_size,
        ..FeedConfig::default()
    }
}

fn start(config: FeedConfig, seeded: usize) -> Fixture {
    let hub = InMemoryPushHub::default();
    let repo = InMemoryRepository::with_push(hub.clone());
    repo.seed(
        &Scope::Global,
        (1..=seeded).map(|i| draft("bob", &format!("m{i}"))),
    )
    .expect("seed should work");

    let handle = FeedController::spawn(
        config,
        Arc::new(repo.clone()),
        Arc::new(hub.clone()),
        Scope::Global,
    );
    let states = handle.subscribe();
    Fixture {
        repo,
        hub,
        handle,
        states,
    }
}

async fn wait_for(
    states: &mut StateStream,
    what: &str,
    predicate: impl Fn(&FeedState) -> bool,
) -> FeedState {
    let wait = async {
        loop {
            match states.recv().await {
                Ok(state) if predicate(&state) => return state,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("state stream closed while waiting for {what}"),
            }
        }
    };
    timeout(Duration::from_secs(120), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_live_with(states: &mut StateStream, ids: &[u64]) -> FeedState {
    wait_for(states, "live feed with expected ids", |state| {
        state.connection == ConnectionStatus::Live && state.message_ids() == ids
    })
    .await
}

/// Let spawned tasks run to quiescence (paused clock only).
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn post(fixture: &Fixture, author: &str, body: &str) {
    fixture
        .repo
        .insert(&Scope::Global, &draft(author, body))
        .await
        .expect("insert should work");
}

#[tokio::test(start_paused = true)]
async fn loads_latest_page_then_goes_live() {
    let mut f = start(config(50), 5);

    let state = wait_live_with(&mut f.states, &[1, 2, 3, 4, 5]).await;
    assert_eq!(state.scope, Scope::Global);
    assert_eq!(state.oldest_cursor.map(|id| id.get()), Some(1));
    assert!(!state.has_more_history);
    assert_eq!(state.unread_count, 0);
    assert!(state.pending.is_empty());
    assert!(state.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn duplicate_deliveries_merge_once() {
    let mut f = start(config(50), 3);
    wait_live_with(&mut f.states, &[1, 2, 3]).await;

    let held = f.repo.all(&Scope::Global).expect("log");
    f.hub.publish(&Scope::Global, &held[1]).expect("publish");
    f.hub.publish(&Scope::Global, &held[1]).expect("publish");
    post(&f, "bob", "m4").await;

    let state = wait_for(&mut f.states, "fourth message", |state| state.messages.len() >= 4).await;
    assert_eq!(state.message_ids(), vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn older_page_and_live_insert_interleave_in_id_order() {
    let mut f = start(config(3), 12);
    wait_live_with(&mut f.states, &[10, 11, 12]).await;
    settle().await;

    f.repo
        .set_fetch_delay(Some(Duration::from_millis(200)))
        .expect("delay");
    f.handle.request_older_page().await.expect("command");
    post(&f, "bob", "m13").await;

    let state = wait_for(&mut f.states, "older page merged", |state| {
        state.messages.len() == 7 && !state.loading_older
    })
    .await;
    assert_eq!(state.message_ids(), vec![7, 8, 9, 10, 11, 12, 13]);
    assert!(state.has_more_history);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backfill_recovers_events_lost_while_offline() {
    let mut f = start(config(50), 3);
    wait_live_with(&mut f.states, &[1, 2, 3]).await;
    post(&f, "bob", "m4").await;
    wait_live_with(&mut f.states, &[1, 2, 3, 4]).await;

    f.hub.set_offline(true).expect("offline");
    wait_for(&mut f.states, "degraded", |state| {
        state.connection == ConnectionStatus::Degraded
    })
    .await;

    for body in ["m5", "m6", "m7"] {
        post(&f, "bob", body).await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    f.hub.set_offline(false).expect("online");

    let state = wait_live_with(&mut f.states, &[1, 2, 3, 4, 5, 6, 7]).await;
    let uninterrupted = f
        .repo
        .fetch_page(&Scope::Global, None, 50)
        .await
        .expect("fetch");
    assert_eq!(state.messages, uninterrupted);
    assert!(f.hub.subscribe_calls().expect("calls") >= 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backfill_does_not_reuse_a_fetch_from_before_the_drop() {
    let mut f = start(
        FeedConfig {
            reconnect_base_ms: 10,
            reconnect_max_ms: 20,
            ..config(50)
        },
        3,
    );
    wait_live_with(&mut f.states, &[1, 2, 3]).await;
    settle().await;

    f.repo
        .set_fetch_delay(Some(Duration::from_secs(2)))
        .expect("delay");
    f.repo.snapshot_at_request(true).expect("snapshot");
    f.hub.drop_connections(&Scope::Global).expect("drop");
    wait_for(&mut f.states, "first drop", |state| {
        state.connection == ConnectionStatus::Degraded
    })
    .await;
    wait_for(&mut f.states, "first reconnect", |state| {
        state.connection == ConnectionStatus::Live
    })
    .await;
    settle().await;

    f.hub.set_offline(true).expect("offline");
    wait_for(&mut f.states, "second drop", |state| {
        state.connection == ConnectionStatus::Degraded
    })
    .await;
    post(&f, "bob", "m4").await;
    f.hub.set_offline(false).expect("online");

    wait_live_with(&mut f.states, &[1, 2, 3, 4]).await;
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_is_reported_degraded_and_recovers() {
    let mut f = start(config(50), 2);
    wait_live_with(&mut f.states, &[1, 2]).await;

    f.hub.drop_connections(&Scope::Global).expect("drop");
    post(&f, "bob", "m3").await;
    wait_for(&mut f.states, "degraded", |state| {
        state.connection == ConnectionStatus::Degraded
    })
    .await;

    wait_live_with(&mut f.states, &[1, 2, 3]).await;
}

#[tokio::test(start_paused = true)]
async fn unread_counts_foreign_messages_away_from_bottom() {
    let mut f = start(config(50), 5);
    wait_live_with(&mut f.states, &[1, 2, 3, 4, 5]).await;

    f.handle.report_viewport(false, false).await.expect("command");
    settle().await;
    for body in ["a", "b", "c"] {
        post(&f, "bob", body).await;
    }
    let state = wait_for(&mut f.states, "three unread", |state| state.messages.len() == 8).await;
    assert_eq!(state.unread_count, 3);

    f.handle
        .send_message(draft("alice", "mine"))
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "own message merged", |state| {
        state.messages.len() == 9 && state.pending.is_empty()
    })
    .await;
    assert_eq!(state.unread_count, 3);

    f.handle.report_viewport(false, true).await.expect("command");
    let state = wait_for(&mut f.states, "unread reset", |state| state.unread_count == 0).await;
    assert_eq!(state.messages.len(), 9);
}

#[tokio::test(start_paused = true)]
async fn local_author_from_config_never_counts_as_unread() {
    let mut f = start(
        FeedConfig {
            local_author: Some("carol".to_owned()),
            ..config(50)
        },
        1,
    );
    wait_live_with(&mut f.states, &[1]).await;

    f.handle.report_viewport(false, false).await.expect("command");
    settle().await;
    post(&f, "carol", "from another device").await;
    post(&f, "bob", "hello").await;

    let state = wait_for(&mut f.states, "both merged", |state| state.messages.len() == 3).await;
    assert_eq!(state.unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_older_requests_issue_one_fetch() {
    let mut f = start(config(3), 12);
    wait_live_with(&mut f.states, &[10, 11, 12]).await;
    settle().await;
    let baseline = f.repo.fetch_calls();

    f.repo
        .set_fetch_delay(Some(Duration::from_millis(500)))
        .expect("delay");
    f.handle.request_older_page().await.expect("command");
    f.handle.request_older_page().await.expect("command");
    f.handle.report_viewport(true, false).await.expect("command");

    let state = wait_for(&mut f.states, "older page merged", |state| {
        state.messages.len() == 6 && !state.loading_older
    })
    .await;
    assert_eq!(state.message_ids(), vec![7, 8, 9, 10, 11, 12]);
    assert_eq!(f.repo.fetch_calls(), baseline + 1);
}

#[tokio::test(start_paused = true)]
async fn scrolling_to_top_pages_until_history_is_exhausted() {
    let mut f = start(config(3), 5);
    wait_live_with(&mut f.states, &[3, 4, 5]).await;

    let at_top = ViewportGeometry {
        offset_px: 0.0,
        viewport_height_px: 400.0,
        content_height_px: 2_000.0,
    };
    let scrolled_down = ViewportGeometry {
        offset_px: 900.0,
        ..at_top
    };

    f.handle.report_scroll(at_top).await.expect("command");
    let state = wait_for(&mut f.states, "second page", |state| {
        state.messages.len() == 5 && !state.loading_older
    })
    .await;
    assert_eq!(state.message_ids(), vec![1, 2, 3, 4, 5]);
    assert!(!state.has_more_history);

    settle().await;
    let calls = f.repo.fetch_calls();
    f.handle.report_scroll(scrolled_down).await.expect("command");
    f.handle.report_scroll(at_top).await.expect("command");
    f.handle.request_older_page().await.expect("command");
    settle().await;
    assert_eq!(f.repo.fetch_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn echoed_send_leaves_exactly_one_message() {
    let mut f = start(config(50), 49);
    wait_for(&mut f.states, "initial page", |state| {
        state.connection == ConnectionStatus::Live && state.messages.len() == 49
    })
    .await;

    f.handle
        .send_message(draft("alice", "hi"))
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "echo merged", |state| {
        state.messages.len() == 50 && state.pending.is_empty()
    })
    .await;
    let his: Vec<_> = state.messages.iter().filter(|m| m.body == "hi").collect();
    assert_eq!(his.len(), 1);
    assert_eq!(his[0].id.get(), 50);

    tokio::time::sleep(Duration::from_secs(6)).await;
    post(&f, "bob", "after").await;
    let state = wait_for(&mut f.states, "later message", |state| state.messages.len() == 51).await;
    assert_eq!(state.messages.iter().filter(|m| m.body == "hi").count(), 1);
    assert_eq!(f.repo.insert_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_echo_falls_back_to_write_result_after_timeout() {
    let mut f = start(config(50), 2);
    wait_live_with(&mut f.states, &[1, 2]).await;
    f.repo.suppress_echoes(true).expect("suppress");

    let sent_at = Instant::now();
    f.handle
        .send_message(draft("alice", "hi"))
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "write confirmed", |state| {
        state
            .pending
            .first()
            .is_some_and(|pending| pending.status == PendingStatus::Confirmed)
    })
    .await;
    assert_eq!(state.message_ids(), vec![1, 2]);

    let state = wait_for(&mut f.states, "write result merged", |state| {
        state.pending.is_empty()
    })
    .await;
    assert_eq!(state.message_ids(), vec![1, 2, 3]);
    assert!(sent_at.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn send_confirmed_before_the_first_page_is_cleared_by_that_page() {
    let mut f = start(config(50), 2);
    f.hub.set_offline(true).expect("offline");
    f.repo
        .set_fetch_delay(Some(Duration::from_millis(500)))
        .expect("delay");
    f.repo.suppress_echoes(true).expect("suppress");

    let sent_at = Instant::now();
    f.handle
        .send_message(draft("alice", "hi"))
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "first page", |state| state.messages.len() == 3).await;
    assert!(state.pending.is_empty(), "stale pending: {:?}", state.pending);
    assert!(sent_at.elapsed() < Duration::from_secs(5));

    f.hub.set_offline(false).expect("online");
    let state = wait_live_with(&mut f.states, &[1, 2, 3]).await;
    assert!(state.pending.is_empty());
    assert_eq!(f.repo.insert_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_send_stays_pending_until_retried() {
    let mut f = start(config(50), 2);
    wait_live_with(&mut f.states, &[1, 2]).await;
    f.repo.fail_next_inserts(1).expect("inject");

    f.handle
        .send_message(draft("alice", "hi"))
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "failed send", |state| {
        state
            .pending
            .first()
            .is_some_and(|pending| pending.status == PendingStatus::Failed)
    })
    .await;
    assert_eq!(state.message_ids(), vec![1, 2]);
    let failed = &state.pending[0];
    assert_eq!(failed.body, "hi");
    assert_eq!(
        failed.error.as_ref().map(|err| err.kind),
        Some(FeedErrorKind::Write)
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(f.repo.insert_calls(), 1);

    f.handle
        .retry_send(failed.temp_key.clone())
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "retried send merged", |state| {
        state.pending.is_empty() && state.messages.len() == 3
    })
    .await;
    assert_eq!(state.messages[2].body, "hi");
    assert_eq!(f.repo.insert_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn discarding_failed_send_and_rejecting_unknown_keys() {
    let mut f = start(config(50), 1);
    wait_live_with(&mut f.states, &[1]).await;
    f.repo.fail_next_inserts(1).expect("inject");

    f.handle
        .send_message(draft("alice", "hi"))
        .await
        .expect("command");
    let state = wait_for(&mut f.states, "failed send", |state| {
        state
            .pending
            .first()
            .is_some_and(|pending| pending.status == PendingStatus::Failed)
    })
    .await;
    let temp_key = state.pending[0].temp_key.clone();

    f.handle
        .discard_send(temp_key.clone())
        .await
        .expect("command");
    wait_for(&mut f.states, "pending discarded", |state| {
        state.pending.is_empty()
    })
    .await;

    f.handle.retry_send(temp_key).await.expect("command");
    let state = wait_for(&mut f.states, "rejection surfaced", |state| {
        state.last_error.is_some()
    })
    .await;
    let err = state.last_error.as_ref().expect("error present");
    assert_eq!(err.code, "pending_not_found");
    assert_eq!(state.message_ids(), vec![1]);
    assert_eq!(f.repo.insert_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_first_load_is_surfaced_and_recovered_on_request() {
    let hub = InMemoryPushHub::default();
    let repo = InMemoryRepository::with_push(hub.clone());
    repo.seed(&Scope::Global, (1..=4).map(|i| draft("bob", &format!("m{i}"))))
        .expect("seed");
    repo.fail_next_fetches(1).expect("inject");
    repo.set_fetch_delay(Some(Duration::from_millis(100)))
        .expect("delay");
    hub.set_offline(true).expect("offline");

    let handle = FeedController::spawn(
        config(50),
        Arc::new(repo.clone()),
        Arc::new(hub.clone()),
        Scope::Global,
    );
    let mut states = handle.subscribe();

    let state = wait_for(&mut states, "fetch failure surfaced", |state| {
        state.last_error.is_some()
    })
    .await;
    assert_eq!(
        state.last_error.as_ref().map(|err| err.code.as_str()),
        Some("fetch_failed")
    );
    assert!(state.messages.is_empty());

    settle().await;
    repo.set_fetch_delay(None).expect("delay");
    handle.request_older_page().await.expect("command");
    let state = wait_for(&mut states, "recovered", |state| {
        state.messages.len() == 4 && state.last_error.is_none() && !state.loading_older
    })
    .await;
    assert_eq!(state.message_ids(), vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn retention_trims_window_while_at_bottom() {
    let mut f = start(
        FeedConfig {
            max_retained: Some(3),
            ..config(50)
        },
        3,
    );
    let state = wait_live_with(&mut f.states, &[1, 2, 3]).await;
    assert!(!state.has_more_history);
    settle().await;

    post(&f, "bob", "m4").await;
    post(&f, "bob", "m5").await;

    let state = wait_for(&mut f.states, "window trimmed", |state| {
        state.message_ids() == [3, 4, 5]
    })
    .await;
    assert!(state.has_more_history);
    assert_eq!(state.oldest_cursor.map(|id| id.get()), Some(3));
}

#[tokio::test(start_paused = true)]
async fn switching_scope_discards_stale_results() {
    let hub = InMemoryPushHub::default();
    let repo = InMemoryRepository::with_push(hub.clone());
    let team = Scope::Team("north".to_owned());
    repo.seed(&Scope::Global, (1..=5).map(|i| draft("bob", &format!("g{i}"))))
        .expect("seed");
    repo.seed(&team, (1..=2).map(|i| draft("bob", &format!("t{i}"))))
        .expect("seed");

    let handle = FeedController::spawn(
        config(2),
        Arc::new(repo.clone()),
        Arc::new(hub.clone()),
        Scope::Global,
    );
    let mut states = handle.subscribe();
    wait_live_with(&mut states, &[4, 5]).await;
    settle().await;

    repo.set_fetch_delay(Some(Duration::from_secs(1)))
        .expect("delay");
    handle.request_older_page().await.expect("command");
    handle.switch_scope(team.clone()).await.expect("command");

    let state = wait_for(&mut states, "team feed", |state| {
        state.scope == team
            && state.connection == ConnectionStatus::Live
            && state.messages.len() == 2
    })
    .await;
    assert_eq!(state.message_ids(), vec![6, 7]);
    assert_eq!(state.unread_count, 0);

    repo.set_fetch_delay(None).expect("delay");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(hub.subscriber_count(&Scope::Global).expect("count"), 0);

    repo.insert(&Scope::Global, &draft("bob", "g6"))
        .await
        .expect("insert");
    repo.insert(&team, &draft("bob", "t3"))
        .await
        .expect("insert");
    let state = wait_for(&mut states, "team insert", |state| state.messages.len() == 3).await;
    assert_eq!(state.scope, team);
    assert_eq!(state.message_ids(), vec![6, 7, 9]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_and_closes_the_command_channel() {
    let mut f = start(config(50), 1);
    wait_live_with(&mut f.states, &[1]).await;

    f.handle.shutdown().await.expect("command");
    let state = wait_for(&mut f.states, "disconnected", |state| {
        state.connection == ConnectionStatus::Disconnected
    })
    .await;
    assert_eq!(state.message_ids(), vec![1]);

    settle().await;
    assert_eq!(f.hub.subscriber_count(&Scope::Global).expect("count"), 0);
    let err = f
        .handle
        .request_older_page()
        .await
        .expect_err("runtime is gone");
    assert!(matches!(err, FeedChannelError::CommandChannelClosed));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_tears_the_runtime_down() {
    let Fixture {
        hub,
        handle,
        mut states,
        ..
    } = start(config(50), 1);
    wait_live_with(&mut states, &[1]).await;

    drop(handle);
    wait_for(&mut states, "disconnected", |state| {
        state.connection == ConnectionStatus::Disconnected
    })
    .await;
    settle().await;
    assert_eq!(hub.subscriber_count(&Scope::Global).expect("count"), 0);
}
